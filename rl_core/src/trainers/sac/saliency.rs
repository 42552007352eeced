// Saliency tracker - smoothed input-gradient magnitudes of the first Q network
use tch::{nn, Kind, Tensor};
use tracing::trace;

use super::mede::{DiverseNetworkVariational, MedeState};
use super::model_utils::{zero_grads, FrozenParams};
use super::networks::q_network::PolicyValueNetwork;
use super::specs::BehaviorSpec;

const SALIENCY_WEIGHT: f64 = 0.01;

pub struct SaliencyTracker {
    /// One flat tensor per observation channel, matching the buffer rows.
    pub sal_observations: Vec<Tensor>,
    pub sal_cont_actions: Tensor,
    weight: f64,
}

impl SaliencyTracker {
    pub fn new(behavior_spec: &BehaviorSpec, device: tch::Device) -> Self {
        Self {
            sal_observations: behavior_spec
                .observation_specs
                .iter()
                .map(|spec| Tensor::zeros([spec.flat_size()], (Kind::Float, device)))
                .collect(),
            sal_cont_actions: Tensor::zeros(
                [behavior_spec.action_spec.continuous_size],
                (Kind::Float, device),
            ),
            weight: SALIENCY_WEIGHT,
        }
    }

    /// Backpropagates the mean Q1 value to the inputs with every critic
    /// weight frozen, folds the gradient magnitudes into the smoothed
    /// statistics and hands them to the discriminator. Critic gradients are
    /// cleared and its weights unfrozen on return.
    #[allow(clippy::too_many_arguments)]
    pub fn refresh(
        &mut self,
        value_vs: &nn::VarStore,
        q_network: &PolicyValueNetwork,
        inputs: &[Tensor],
        cont_actions: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
        mede: &DiverseNetworkVariational,
        state: &mut MedeState,
    ) {
        {
            let _frozen = FrozenParams::new(value_vs);
            let inputs: Vec<Tensor> = inputs
                .iter()
                .map(|obs| obs.detach().set_requires_grad(true))
                .collect();
            let actions = cont_actions.map(|a| a.detach().set_requires_grad(true));

            let (q1_out, _) =
                q_network.forward(&inputs, actions.as_ref(), memories, sequence_length, true, false);
            let streams: Vec<Tensor> = q1_out.values().map(|q| q.shallow_clone()).collect();
            let q = Tensor::stack(&streams, 0).mean(Kind::Float);
            q.backward();

            for (sal, obs) in self.sal_observations.iter_mut().zip(&inputs) {
                let grad = Self::mean_abs_grad(obs);
                *sal = self.weight * grad + (1.0 - self.weight) * &*sal;
            }
            if let Some(actions) = &actions {
                let grad = Self::mean_abs_grad(actions);
                self.sal_cont_actions = self.weight * grad + (1.0 - self.weight) * &self.sal_cont_actions;
            }
        }
        mede.update_saliency(&self.sal_observations, &self.sal_cont_actions, state);
        zero_grads(value_vs);
        trace!("saliency refreshed");
    }

    fn mean_abs_grad(input: &Tensor) -> Tensor {
        let grad = input.grad();
        if grad.defined() {
            grad.abs().mean_dim(&[0i64][..], false, Kind::Float)
        } else {
            input.get(0).zeros_like()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::sac::specs::{ActionSpec, ObservationSpec};
    use crate::trainers::settings::{NetworkSettings, SACSettings};
    use tch::Device;

    #[test]
    fn test_refresh_smooths_and_restores_critic() {
        let spec = BehaviorSpec::new(
            vec![ObservationSpec::vector("obs", 3), ObservationSpec::goal_signal("goal", 2)],
            ActionSpec::new(2, vec![]),
        );
        let value_vs = nn::VarStore::new(Device::Cpu);
        let q_network = PolicyValueNetwork::new(
            &value_vs.root(),
            &["extrinsic".to_string()],
            &spec.observation_specs,
            &NetworkSettings::default(),
            &spec.action_spec,
        );
        let mede_vs = nn::VarStore::new(Device::Cpu);
        let hyper = SACSettings {
            mede: true,
            mede_use_actions: true,
            mede_drop_actions: true,
            mede_saliency_dropout: 0.5,
            ..Default::default()
        };
        let (mede, mut state) =
            DiverseNetworkVariational::new(&mede_vs.root(), &spec, &hyper, &NetworkSettings::default()).unwrap();

        let mut tracker = SaliencyTracker::new(&spec, Device::Cpu);
        let inputs = vec![
            Tensor::rand([8, 3], (Kind::Float, Device::Cpu)),
            Tensor::rand([8, 2], (Kind::Float, Device::Cpu)),
        ];
        let actions = Tensor::rand([8, 2], (Kind::Float, Device::Cpu));
        tracker.refresh(&value_vs, &q_network, &inputs, Some(&actions), None, 1, &mede, &mut state);

        assert_eq!(tracker.sal_observations[0].size(), vec![3]);
        assert!(tracker.sal_observations[0].sum(Kind::Float).double_value(&[]) > 0.0);
        assert!(tracker.sal_cont_actions.sum(Kind::Float).double_value(&[]) > 0.0);

        let max_drop = state.observations_sal_drop[0].max().double_value(&[]);
        assert!((max_drop - 0.5).abs() < 1e-6);
        for var in value_vs.trainable_variables() {
            assert!(var.requires_grad());
            let grad = var.grad();
            assert!(!grad.defined() || grad.abs().sum(Kind::Float).double_value(&[]) == 0.0);
        }
    }

    #[test]
    fn test_refresh_flattens_multi_dimensional_channels() {
        let grid = ObservationSpec {
            name: "grid".to_string(),
            shape: vec![2, 3],
            observation_type: crate::trainers::sac::specs::ObservationType::Default,
        };
        let spec = BehaviorSpec::new(
            vec![grid, ObservationSpec::goal_signal("goal", 2)],
            ActionSpec::new(1, vec![]),
        );
        let value_vs = nn::VarStore::new(Device::Cpu);
        let q_network = PolicyValueNetwork::new(
            &value_vs.root(),
            &["extrinsic".to_string()],
            &spec.observation_specs,
            &NetworkSettings::default(),
            &spec.action_spec,
        );
        let mede_vs = nn::VarStore::new(Device::Cpu);
        let hyper = SACSettings {
            mede: true,
            mede_saliency_dropout: 0.2,
            ..Default::default()
        };
        let (mede, mut state) =
            DiverseNetworkVariational::new(&mede_vs.root(), &spec, &hyper, &NetworkSettings::default()).unwrap();

        let mut tracker = SaliencyTracker::new(&spec, Device::Cpu);
        assert_eq!(tracker.sal_observations[0].size(), vec![6]);
        let inputs = vec![
            Tensor::rand([8, 6], (Kind::Float, Device::Cpu)),
            Tensor::rand([8, 2], (Kind::Float, Device::Cpu)),
        ];
        let actions = Tensor::rand([8, 1], (Kind::Float, Device::Cpu));
        tracker.refresh(&value_vs, &q_network, &inputs, Some(&actions), None, 1, &mede, &mut state);

        assert_eq!(state.observations_sal_drop[0].size(), vec![6]);
        let max_drop = state.observations_sal_drop[0].max().double_value(&[]);
        assert!((max_drop - 0.2).abs() < 1e-6);
    }
}
