// Policy - the actor seen by the optimizer
use tch::{nn, Device, Tensor};
use tracing::debug;

use crate::trainers::sac::networks::actor::{ActorNetwork, ActorOutput};
use crate::trainers::sac::networks::body::NetworkBody;
use crate::trainers::sac::specs::BehaviorSpec;
use crate::trainers::settings::NetworkSettings;

/// Contract the SAC optimizer needs from an actor.
pub trait Policy {
    fn behavior_spec(&self) -> &BehaviorSpec;

    fn network_settings(&self) -> &NetworkSettings;

    /// Parameters owned by the policy optimizer.
    fn var_store(&self) -> &nn::VarStore;

    /// Body whose normalization statistics the critics mirror.
    fn network_body(&self) -> &NetworkBody;

    fn get_current_step(&self) -> u64;

    fn get_action_and_stats(
        &self,
        inputs: &[Tensor],
        masks: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
    ) -> ActorOutput;

    /// Actor and critic sharing weights.
    fn shared_critic(&self) -> bool {
        false
    }

    fn use_recurrent(&self) -> bool {
        self.network_settings().memory.is_some()
    }

    fn sequence_length(&self) -> i64 {
        self.network_settings()
            .memory
            .map(|m| m.sequence_length)
            .unwrap_or(1)
    }

    fn device(&self) -> Device {
        self.var_store().device()
    }
}

pub struct TorchPolicy {
    behavior_spec: BehaviorSpec,
    network_settings: NetworkSettings,
    var_store: nn::VarStore,
    actor: ActorNetwork,
    shared_critic: bool,
    global_step: u64,
}

impl TorchPolicy {
    pub fn new(behavior_spec: BehaviorSpec, network_settings: NetworkSettings, device: Device) -> Self {
        let var_store = nn::VarStore::new(device);
        let actor = ActorNetwork::new(&var_store.root(), &behavior_spec, &network_settings);
        debug!(
            parameters = var_store.trainable_variables().len(),
            continuous = behavior_spec.action_spec.continuous_size,
            branches = ?behavior_spec.action_spec.discrete_branches,
            "built policy"
        );
        Self {
            behavior_spec,
            network_settings,
            var_store,
            actor,
            shared_critic: false,
            global_step: 0,
        }
    }

    pub fn with_shared_critic(mut self, shared: bool) -> Self {
        self.shared_critic = shared;
        self
    }

    pub fn increment_step(&mut self, n_steps: u64) -> u64 {
        self.global_step += n_steps;
        self.global_step
    }

    pub fn set_step(&mut self, step: u64) {
        self.global_step = step;
    }

    pub fn actor(&self) -> &ActorNetwork {
        &self.actor
    }
}

impl Policy for TorchPolicy {
    fn behavior_spec(&self) -> &BehaviorSpec {
        &self.behavior_spec
    }

    fn network_settings(&self) -> &NetworkSettings {
        &self.network_settings
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    fn network_body(&self) -> &NetworkBody {
        &self.actor.network_body
    }

    fn get_current_step(&self) -> u64 {
        self.global_step
    }

    fn get_action_and_stats(
        &self,
        inputs: &[Tensor],
        masks: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
    ) -> ActorOutput {
        self.actor.get_action_and_stats(inputs, masks, memories, sequence_length)
    }

    fn shared_critic(&self) -> bool {
        self.shared_critic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::sac::specs::{ActionSpec, ObservationSpec};
    use crate::trainers::settings::MemorySettings;

    #[test]
    fn test_step_counter_and_defaults() {
        let spec = BehaviorSpec::new(vec![ObservationSpec::vector("obs", 2)], ActionSpec::new(1, vec![]));
        let mut policy = TorchPolicy::new(spec, NetworkSettings::default(), Device::Cpu);
        assert_eq!(policy.increment_step(10), 10);
        assert_eq!(policy.get_current_step(), 10);
        policy.set_step(3);
        assert_eq!(policy.get_current_step(), 3);
        assert_eq!(policy.sequence_length(), 1);
        assert!(!policy.use_recurrent());
        assert!(!policy.shared_critic());
    }

    #[test]
    fn test_recurrent_sequence_length() {
        let spec = BehaviorSpec::new(vec![ObservationSpec::vector("obs", 2)], ActionSpec::new(0, vec![2]));
        let settings = NetworkSettings {
            memory: Some(MemorySettings {
                memory_size: 8,
                sequence_length: 4,
            }),
            ..Default::default()
        };
        let policy = TorchPolicy::new(spec, settings, Device::Cpu).with_shared_critic(true);
        assert_eq!(policy.sequence_length(), 4);
        assert!(policy.shared_critic());
    }
}
