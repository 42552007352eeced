// Tensor helpers shared by the SAC optimizer, its networks and MEDE
use tch::{nn, nn::OptimizerConfig, Kind, Tensor};
use tracing::trace;

use crate::error::{Result, TrainerError};
use crate::trainers::settings::ScheduleType;

/// Splits the last axis of a `(batch, sum(branches))` tensor into one tensor
/// per branch.
pub fn break_into_branches(concatenated: &Tensor, branches: &[i64]) -> Vec<Tensor> {
    concatenated.split_with_sizes(branches, 1)
}

/// One-hot encodes `(batch, n_branches)` integer actions, one tensor per branch.
pub fn actions_to_onehot(discrete_actions: &Tensor, branches: &[i64]) -> Vec<Tensor> {
    branches
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            discrete_actions
                .select(1, i as i64)
                .to_kind(Kind::Int64)
                .one_hot(size)
                .to_kind(Kind::Float)
        })
        .collect()
}

/// Mean of `tensor` over the entries where `masks` is set. Never divides by zero.
pub fn masked_mean(tensor: &Tensor, masks: &Tensor) -> Tensor {
    let masks = masks.to_kind(Kind::Float);
    (tensor * &masks).sum(Kind::Float) / masks.sum(Kind::Float).clamp_min(1.0)
}

/// Sums a per-branch tensor list into a `(branches, batch, 1)` stack of
/// per-branch row sums.
pub fn stacked_branch_sums(branches: &[Tensor]) -> Tensor {
    let sums: Vec<Tensor> = branches
        .iter()
        .map(|b| b.sum_dim_intlist(&[1i64][..], true, Kind::Float))
        .collect();
    Tensor::stack(&sums, 0)
}

/// Polyak averaging `target = tau * source + (1 - tau) * target`, matched by
/// variable name. Covers non-trainable buffers as well as parameters.
pub fn soft_update(source: &nn::VarStore, target: &nn::VarStore, tau: f64) -> Result<()> {
    let source_vars = source.variables();
    tch::no_grad(|| -> Result<()> {
        for (name, mut dest) in target.variables() {
            let src = source_vars.get(&name).ok_or_else(|| {
                TrainerError::ConfigConflict(format!("soft update source has no variable {}", name))
            })?;
            dest.copy_(&(tau * src + (1.0 - tau) * &dest));
        }
        Ok(())
    })?;
    trace!(tau, "soft update");
    Ok(())
}

/// Clears the accumulated gradient of every variable in a store.
pub fn zero_grads(vs: &nn::VarStore) {
    for mut var in vs.trainable_variables() {
        var.zero_grad();
    }
}

/// Learning-rate schedule: constant, or linear decay to `min_value` at
/// `max_step`.
#[derive(Debug, Clone, Copy)]
pub struct DecayedValue {
    schedule: ScheduleType,
    initial_value: f64,
    min_value: f64,
    max_step: u64,
}

impl DecayedValue {
    pub fn new(schedule: ScheduleType, initial_value: f64, min_value: f64, max_step: u64) -> Self {
        Self {
            schedule,
            initial_value,
            min_value,
            max_step,
        }
    }

    pub fn get_value(&self, global_step: u64) -> f64 {
        match self.schedule {
            ScheduleType::Constant => self.initial_value,
            ScheduleType::Linear => {
                if self.max_step == 0 {
                    return self.min_value;
                }
                let step = global_step.min(self.max_step) as f64;
                let remaining = 1.0 - step / self.max_step as f64;
                (self.initial_value - self.min_value) * remaining + self.min_value
            }
        }
    }
}

/// Adam optimizer over one VarStore that counts its steps.
pub struct TrackedOptimizer {
    inner: nn::Optimizer,
    learning_rate: f64,
    steps: u64,
}

impl TrackedOptimizer {
    pub fn adam(vs: &nn::VarStore, learning_rate: f64, weight_decay: f64) -> Result<Self> {
        let config = nn::Adam {
            wd: weight_decay,
            ..Default::default()
        };
        Ok(Self {
            inner: config.build(vs, learning_rate)?,
            learning_rate,
            steps: 0,
        })
    }

    pub fn set_lr(&mut self, learning_rate: f64) {
        self.inner.set_lr(learning_rate);
        self.learning_rate = learning_rate;
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    /// Clears gradients, backpropagates `loss` and applies one step.
    pub fn backward_step(&mut self, loss: &Tensor) {
        self.inner.zero_grad();
        loss.backward();
        self.inner.step();
        self.steps += 1;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Restores the step count of a checkpointed optimizer.
    pub fn set_steps(&mut self, steps: u64) {
        self.steps = steps;
    }
}

/// Disables gradient tracking on every trainable variable of a store until
/// dropped. Inputs can still receive gradients while the guard is alive.
pub struct FrozenParams {
    vars: Vec<Tensor>,
}

impl FrozenParams {
    pub fn new(vs: &nn::VarStore) -> Self {
        let vars = vs.trainable_variables();
        for var in &vars {
            let _ = var.set_requires_grad(false);
        }
        Self { vars }
    }
}

impl Drop for FrozenParams {
    fn drop(&mut self) {
        for var in &self.vars {
            let _ = var.set_requires_grad(true);
        }
    }
}
