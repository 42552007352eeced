// Reward signals - per-stream reward providers consumed by the optimizer
use std::collections::BTreeMap;
use tch::nn;

use crate::error::{Result, TrainerError};
use crate::trainers::buffer::AgentBuffer;
use crate::trainers::settings::RewardSignalSettings;

pub trait RewardSignal {
    fn name(&self) -> &str;

    fn gamma(&self) -> f64;

    /// Whether this stream bootstraps through terminal steps.
    fn ignore_done(&self) -> bool;

    fn strength(&self) -> f64;

    /// Trains the provider on a mini-batch; returns its stats.
    fn update(&mut self, batch: &AgentBuffer) -> Result<BTreeMap<String, f64>>;

    /// Trainable parts to checkpoint, keyed by module name.
    fn get_modules(&self) -> Vec<(String, &nn::VarStore)> {
        Vec::new()
    }
}

/// Environment reward. The buffer already holds it in the `extrinsic`
/// reward column, so there is nothing to train.
pub struct ExtrinsicRewardSignal {
    settings: RewardSignalSettings,
}

impl ExtrinsicRewardSignal {
    pub fn new(settings: RewardSignalSettings) -> Self {
        Self { settings }
    }
}

impl RewardSignal for ExtrinsicRewardSignal {
    fn name(&self) -> &str {
        "extrinsic"
    }

    fn gamma(&self) -> f64 {
        self.settings.gamma
    }

    fn ignore_done(&self) -> bool {
        self.settings.ignore_done
    }

    fn strength(&self) -> f64 {
        self.settings.strength
    }

    fn update(&mut self, _batch: &AgentBuffer) -> Result<BTreeMap<String, f64>> {
        Ok(BTreeMap::new())
    }
}

pub type RewardSignals = BTreeMap<String, Box<dyn RewardSignal>>;

/// Builds one provider per configured stream.
pub fn create_reward_signals(settings: &BTreeMap<String, RewardSignalSettings>) -> Result<RewardSignals> {
    let mut signals: RewardSignals = BTreeMap::new();
    for (name, signal_settings) in settings {
        let signal: Box<dyn RewardSignal> = match name.as_str() {
            "extrinsic" => Box::new(ExtrinsicRewardSignal::new(signal_settings.clone())),
            other => {
                return Err(TrainerError::ConfigConflict(format!(
                    "unsupported reward signal: {}",
                    other
                )))
            }
        };
        signals.insert(name.clone(), signal);
    }
    Ok(signals)
}
