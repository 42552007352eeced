// Twin Q Networks - two independently parameterized action-value networks
use tch::{nn, Tensor};

use super::value::{StreamValues, ValueNetwork};
use crate::trainers::sac::specs::{ActionSpec, ObservationSpec};
use crate::trainers::settings::NetworkSettings;

pub struct PolicyValueNetwork {
    pub q1_network: ValueNetwork,
    pub q2_network: ValueNetwork,
}

impl PolicyValueNetwork {
    /// Continuous actions are network inputs; discrete actions are outputs,
    /// one Q value per action of every branch.
    pub fn new(
        path: &nn::Path,
        stream_names: &[String],
        observation_specs: &[ObservationSpec],
        settings: &NetworkSettings,
        action_spec: &ActionSpec,
    ) -> Self {
        let num_value_outs = action_spec.total_discrete_actions().max(1);
        let num_action_ins = action_spec.continuous_size;
        let build = |name: &str| {
            ValueNetwork::new(
                &(path / name),
                stream_names,
                observation_specs,
                settings,
                num_action_ins,
                num_value_outs,
            )
        };
        Self {
            q1_network: build("q1_network"),
            q2_network: build("q2_network"),
        }
    }

    /// Evaluates both heads. A head whose `*_grad` flag is false runs without
    /// recording a graph, so losses built on it never reach its weights.
    pub fn forward(
        &self,
        inputs: &[Tensor],
        actions: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
        q1_grad: bool,
        q2_grad: bool,
    ) -> (StreamValues, StreamValues) {
        let q1_out = Self::evaluate(&self.q1_network, inputs, actions, memories, sequence_length, q1_grad);
        let q2_out = Self::evaluate(&self.q2_network, inputs, actions, memories, sequence_length, q2_grad);
        (q1_out, q2_out)
    }

    fn evaluate(
        network: &ValueNetwork,
        inputs: &[Tensor],
        actions: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
        track_grad: bool,
    ) -> StreamValues {
        let pass = || network.forward(inputs, actions, memories, sequence_length).0;
        if track_grad {
            pass()
        } else {
            tch::no_grad(pass)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn build(action_spec: &ActionSpec) -> (nn::VarStore, PolicyValueNetwork) {
        let vs = nn::VarStore::new(Device::Cpu);
        let network = PolicyValueNetwork::new(
            &vs.root(),
            &["extrinsic".to_string()],
            &[ObservationSpec::vector("obs", 3)],
            &NetworkSettings::default(),
            action_spec,
        );
        (vs, network)
    }

    #[test]
    fn test_output_width_follows_discrete_branches() {
        let (_vs, network) = build(&ActionSpec::new(1, vec![2, 3]));
        let inputs = vec![Tensor::rand([4, 3], (Kind::Float, Device::Cpu))];
        let action = Tensor::rand([4, 1], (Kind::Float, Device::Cpu));
        let (q1, q2) = network.forward(&inputs, Some(&action), None, 1, true, true);
        assert_eq!(q1["extrinsic"].size(), vec![4, 5]);
        assert_eq!(q2["extrinsic"].size(), vec![4, 5]);
    }

    #[test]
    fn test_disabled_head_has_no_graph() {
        let (_vs, network) = build(&ActionSpec::new(2, vec![]));
        let inputs = vec![Tensor::rand([4, 3], (Kind::Float, Device::Cpu))];
        let action = Tensor::rand([4, 2], (Kind::Float, Device::Cpu));
        let (q1, q2) = network.forward(&inputs, Some(&action), None, 1, true, false);
        assert_eq!(q1["extrinsic"].size(), vec![4]);
        assert!(q1["extrinsic"].requires_grad());
        assert!(!q2["extrinsic"].requires_grad());
    }
}
