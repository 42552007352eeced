// Value Network - per-reward-stream value heads over a network body
use std::collections::BTreeMap;
use tch::{nn, nn::Module, Tensor};

use super::body::NetworkBody;
use crate::trainers::sac::specs::ObservationSpec;
use crate::trainers::settings::NetworkSettings;

/// Reward-stream name to value tensor.
pub type StreamValues = BTreeMap<String, Tensor>;

pub struct ValueNetwork {
    pub network_body: NetworkBody,
    heads: BTreeMap<String, nn::Linear>,
    outputs: i64,
}

impl ValueNetwork {
    /// `outputs == 1` yields `(batch,)` values; wider heads keep `(batch, outputs)`.
    pub fn new(
        path: &nn::Path,
        stream_names: &[String],
        observation_specs: &[ObservationSpec],
        settings: &NetworkSettings,
        action_input_size: i64,
        outputs: i64,
    ) -> Self {
        let network_body = NetworkBody::new(
            &(path / "network_body"),
            observation_specs,
            settings,
            action_input_size,
        );
        let encoding = network_body.output_size();
        let heads = stream_names
            .iter()
            .map(|name| {
                let head = nn::linear(path.sub("value_heads").sub(name.as_str()), encoding, outputs, Default::default());
                (name.clone(), head)
            })
            .collect();
        Self {
            network_body,
            heads,
            outputs,
        }
    }

    pub fn forward(
        &self,
        inputs: &[Tensor],
        actions: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
    ) -> (StreamValues, Option<Tensor>) {
        let (encoding, new_memories) =
            self.network_body.forward(inputs, actions, memories, sequence_length);
        let values = self
            .heads
            .iter()
            .map(|(name, head)| {
                let out = head.forward(&encoding);
                let out = if self.outputs == 1 { out.squeeze_dim(-1) } else { out };
                (name.clone(), out)
            })
            .collect();
        (values, new_memories)
    }

    /// State-value pass used for the critic and the target network.
    pub fn critic_pass(
        &self,
        inputs: &[Tensor],
        memories: Option<&Tensor>,
        sequence_length: i64,
    ) -> (StreamValues, Option<Tensor>) {
        self.forward(inputs, None, memories, sequence_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_stream_heads() {
        let vs = nn::VarStore::new(Device::Cpu);
        let streams = vec!["extrinsic".to_string(), "curiosity".to_string()];
        let specs = vec![ObservationSpec::vector("obs", 4)];
        let network = ValueNetwork::new(&vs.root(), &streams, &specs, &NetworkSettings::default(), 0, 1);
        let inputs = vec![Tensor::rand([5, 4], (Kind::Float, Device::Cpu))];
        let (values, memories) = network.critic_pass(&inputs, None, 1);
        assert!(memories.is_none());
        assert_eq!(values.len(), 2);
        assert_eq!(values["curiosity"].size(), vec![5]);
    }
}
