// Agent actions and their log-probabilities, split by action kind
use tch::{Device, Kind, Tensor};

use super::specs::ActionSpec;
use crate::error::Result;
use crate::trainers::buffer::{AgentBuffer, BufferKey};

/// Continuous `(batch, continuous_size)` and discrete `(batch, n_branches)`
/// actions. Absent kinds are zero-width tensors.
#[derive(Debug)]
pub struct AgentAction {
    pub continuous_tensor: Tensor,
    pub discrete_tensor: Tensor,
}

impl AgentAction {
    pub fn from_buffer(batch: &AgentBuffer, action_spec: &ActionSpec, device: Device) -> Result<Self> {
        let rows = batch.num_experiences() as i64;
        let continuous_tensor = if action_spec.has_continuous() {
            batch.to_tensor(&BufferKey::ContinuousAction, device)?
        } else {
            Tensor::zeros([rows, 0], (Kind::Float, device))
        };
        let discrete_tensor = if action_spec.has_discrete() {
            batch.to_tensor(&BufferKey::DiscreteAction, device)?.to_kind(Kind::Int64)
        } else {
            Tensor::zeros([rows, 0], (Kind::Int64, device))
        };
        Ok(Self {
            continuous_tensor,
            discrete_tensor,
        })
    }

    pub fn detach(&self) -> Self {
        Self {
            continuous_tensor: self.continuous_tensor.detach(),
            discrete_tensor: self.discrete_tensor.detach(),
        }
    }
}

/// Per-dimension continuous log-probabilities `(batch, continuous_size)` and
/// the concatenated per-branch discrete log-probabilities
/// `(batch, sum(discrete_branches))`.
#[derive(Debug)]
pub struct ActionLogProbs {
    pub continuous_tensor: Tensor,
    pub all_discrete_tensor: Tensor,
}

impl ActionLogProbs {
    pub fn detach(&self) -> Self {
        Self {
            continuous_tensor: self.continuous_tensor.detach(),
            all_discrete_tensor: self.all_discrete_tensor.detach(),
        }
    }
}
