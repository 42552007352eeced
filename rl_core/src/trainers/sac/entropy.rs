// Entropy coefficients and target entropies
use tch::{nn, Device, Tensor};

use super::specs::ActionSpec;

const DISCRETE_TARGET_ENTROPY_SCALE: f64 = 0.2;
const CONTINUOUS_TARGET_ENTROPY_SCALE: f64 = 1.0;

/// Learnable log entropy coefficients, one for the continuous space and one
/// per discrete branch. Lives in its own store so only the entropy optimizer
/// touches it.
pub struct LogEntCoef {
    pub var_store: nn::VarStore,
    continuous: Tensor,
    discrete: Tensor,
}

impl LogEntCoef {
    pub fn new(action_spec: &ActionSpec, init_entcoef: f64, device: Device) -> Self {
        let var_store = nn::VarStore::new(device);
        let root = var_store.root();
        let log_init = init_entcoef.ln();
        let continuous = root.var("continuous", &[1], nn::Init::Const(log_init));
        let discrete = root.var(
            "discrete",
            &[action_spec.discrete_size().max(1)],
            nn::Init::Const(log_init),
        );
        Self {
            var_store,
            continuous,
            discrete,
        }
    }

    pub fn log_continuous(&self) -> &Tensor {
        &self.continuous
    }

    pub fn log_discrete(&self) -> &Tensor {
        &self.discrete
    }

    /// `exp(log_alpha_continuous)`, shape `[1]`.
    pub fn continuous(&self) -> Tensor {
        positive_exp(&self.continuous)
    }

    /// `exp(log_alpha_discrete)`, one entry per branch.
    pub fn discrete(&self) -> Tensor {
        positive_exp(&self.discrete)
    }
}

/// f32 `exp` underflows to zero below about -104; floor at the smallest
/// normal value instead.
fn positive_exp(log_value: &Tensor) -> Tensor {
    log_value.exp().clamp_min(f32::MIN_POSITIVE as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetEntropy {
    pub continuous: f64,
    pub discrete: Vec<f64>,
}

impl TargetEntropy {
    pub fn new(action_spec: &ActionSpec) -> Self {
        Self {
            continuous: -CONTINUOUS_TARGET_ENTROPY_SCALE * action_spec.continuous_size as f64,
            discrete: action_spec
                .discrete_branches
                .iter()
                .map(|&k| DISCRETE_TARGET_ENTROPY_SCALE * (k as f64).ln())
                .collect(),
        }
    }
}
