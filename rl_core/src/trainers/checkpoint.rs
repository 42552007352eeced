// Checkpoint management system
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tch::{nn, Tensor};
use tracing::info;

use crate::error::Result;
use crate::trainers::sac::model_utils::TrackedOptimizer;

/// One entry of a trainer's module registry.
pub enum ModuleRef<'a> {
    /// Variables of a store whose top-level path is one of `scopes`, or every
    /// variable when `scopes` is empty.
    Variables {
        store: &'a nn::VarStore,
        scopes: &'static [&'static str],
    },
    Optimizer(&'a TrackedOptimizer),
}

/// Persisted part of an optimizer. Adam moments are rebuilt on resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerState {
    pub steps: u64,
    pub learning_rate: f64,
}

fn in_scopes(var_name: &str, scopes: &[&str]) -> bool {
    scopes.is_empty() || var_name.split('.').next().map_or(false, |top| scopes.contains(&top))
}

pub trait Checkpointable {
    fn get_modules(&self) -> Vec<(String, ModuleRef<'_>)>;

    /// Applies restored optimizer state; modules without a match are skipped.
    fn restore_optimizer(&mut self, _name: &str, _state: &OptimizerState) {}
}

pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    keep_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P, keep_checkpoints: usize) -> Result<Self> {
        fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            keep_checkpoints,
        })
    }

    /// Writes every module to `<dir>/<behavior>-<step>/` and prunes older
    /// checkpoints of the same behavior.
    pub fn save_checkpoint(
        &self,
        trainer: &dyn Checkpointable,
        step: u64,
        behavior_name: &str,
    ) -> Result<PathBuf> {
        let checkpoint_path = self
            .checkpoint_dir
            .join(format!("{}-{}", behavior_name, step));
        fs::create_dir_all(&checkpoint_path)?;

        for (name, module) in trainer.get_modules() {
            match module {
                ModuleRef::Variables { store, scopes } => {
                    let named: Vec<(String, Tensor)> = store
                        .variables()
                        .into_iter()
                        .filter(|(var, _)| in_scopes(var, scopes))
                        .collect();
                    Tensor::save_multi(named.as_slice(), checkpoint_path.join(format!("{}.pt", name)))?;
                }
                ModuleRef::Optimizer(optimizer) => {
                    let state = OptimizerState {
                        steps: optimizer.steps(),
                        learning_rate: optimizer.learning_rate(),
                    };
                    fs::write(
                        checkpoint_path.join(format!("{}.json", name)),
                        serde_json::to_string_pretty(&state)?,
                    )?;
                }
            }
        }

        self.cleanup_old_checkpoints(behavior_name)?;
        info!(path = %checkpoint_path.display(), "checkpoint saved");
        Ok(checkpoint_path)
    }

    /// Copies saved variables back into the trainer's stores by name.
    pub fn load_checkpoint(&self, trainer: &mut dyn Checkpointable, checkpoint_path: &Path) -> Result<()> {
        let mut optimizer_states = Vec::new();
        for (name, module) in trainer.get_modules() {
            match module {
                ModuleRef::Variables { store, .. } => {
                    let saved = Tensor::load_multi(checkpoint_path.join(format!("{}.pt", name)))?;
                    let variables = store.variables();
                    tch::no_grad(|| {
                        for (var_name, value) in &saved {
                            if let Some(var) = variables.get(var_name) {
                                var.shallow_clone().copy_(value);
                            }
                        }
                    });
                }
                ModuleRef::Optimizer(_) => {
                    let content = fs::read_to_string(checkpoint_path.join(format!("{}.json", name)))?;
                    let state: OptimizerState = serde_json::from_str(&content)?;
                    optimizer_states.push((name, state));
                }
            }
        }
        for (name, state) in &optimizer_states {
            trainer.restore_optimizer(name, state);
        }
        info!(path = %checkpoint_path.display(), "checkpoint loaded");
        Ok(())
    }

    fn cleanup_old_checkpoints(&self, behavior_name: &str) -> Result<()> {
        let re = Regex::new(&format!(r"^{}-(\d+)$", regex::escape(behavior_name)))?;

        let mut checkpoints: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let step = file_name
                .to_str()
                .and_then(|name| re.captures(name))
                .and_then(|captures| captures.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok());
            if let Some(step) = step {
                checkpoints.push((step, entry.path()));
            }
        }

        // newest first
        checkpoints.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, old_checkpoint) in checkpoints.iter().skip(self.keep_checkpoints) {
            fs::remove_dir_all(old_checkpoint)?;
            info!(path = %old_checkpoint.display(), "removed old checkpoint");
        }
        Ok(())
    }
}
