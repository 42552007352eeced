// Behavior specification - observation channels and action space shape
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationType {
    #[default]
    Default,
    /// The channel MEDE tries to predict; one-hot or near one-hot.
    GoalSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSpec {
    pub name: String,
    pub shape: Vec<i64>,
    #[serde(default)]
    pub observation_type: ObservationType,
}

impl ObservationSpec {
    pub fn vector(name: &str, size: i64) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![size],
            observation_type: ObservationType::Default,
        }
    }

    pub fn goal_signal(name: &str, size: i64) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![size],
            observation_type: ObservationType::GoalSignal,
        }
    }

    /// Number of scalars in one observation of this channel.
    pub fn flat_size(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn is_goal_signal(&self) -> bool {
        self.observation_type == ObservationType::GoalSignal
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub continuous_size: i64,
    /// Cardinality of each discrete branch, in order.
    pub discrete_branches: Vec<i64>,
}

impl ActionSpec {
    pub fn new(continuous_size: i64, discrete_branches: Vec<i64>) -> Self {
        Self {
            continuous_size,
            discrete_branches,
        }
    }

    pub fn discrete_size(&self) -> i64 {
        self.discrete_branches.len() as i64
    }

    /// Sum of all branch cardinalities.
    pub fn total_discrete_actions(&self) -> i64 {
        self.discrete_branches.iter().sum()
    }

    pub fn has_continuous(&self) -> bool {
        self.continuous_size > 0
    }

    pub fn has_discrete(&self) -> bool {
        !self.discrete_branches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSpec {
    pub observation_specs: Vec<ObservationSpec>,
    pub action_spec: ActionSpec,
}

impl BehaviorSpec {
    pub fn new(observation_specs: Vec<ObservationSpec>, action_spec: ActionSpec) -> Self {
        Self {
            observation_specs,
            action_spec,
        }
    }

    /// Index of the GOAL_SIGNAL channel. More than one is a configuration error.
    pub fn goal_signal_index(&self) -> Result<Option<usize>> {
        let mut goals = self
            .observation_specs
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.is_goal_signal())
            .map(|(i, _)| i);
        let first = goals.next();
        if goals.next().is_some() {
            return Err(TrainerError::ConfigConflict(
                "at most one GOAL_SIGNAL observation is supported".to_string(),
            ));
        }
        Ok(first)
    }
}
