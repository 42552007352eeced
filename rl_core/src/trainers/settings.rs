// Settings module - trainer configuration loaded from YAML
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, TrainerError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub behaviors: BTreeMap<String, TrainerSettings>,
    #[serde(default)]
    pub checkpoint_settings: CheckpointSettings,
    #[serde(default)]
    pub torch_settings: TorchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_write_path")]
    pub write_path: String,
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: usize,
}

fn default_write_path() -> String {
    "results".to_string()
}

fn default_keep_checkpoints() -> usize {
    5
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            write_path: default_write_path(),
            keep_checkpoints: default_keep_checkpoints(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorchSettings {
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String {
    "cpu".to_string()
}

impl Default for TorchSettings {
    fn default() -> Self {
        Self {
            device: default_device(),
        }
    }
}

impl TorchSettings {
    /// Parses `cpu`, `cuda`, `cuda:N` or `mps`; anything else falls back to cpu.
    pub fn device(&self) -> tch::Device {
        match self.device.as_str() {
            "cuda" => tch::Device::cuda_if_available(),
            "mps" => tch::Device::Mps,
            other => other
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse::<usize>().ok())
                .map(tch::Device::Cuda)
                .unwrap_or(tch::Device::Cpu),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSettings {
    #[serde(default)]
    pub trainer_type: TrainerType,
    #[serde(default)]
    pub hyperparameters: SACSettings,
    #[serde(default)]
    pub network_settings: NetworkSettings,
    #[serde(default = "default_reward_signals")]
    pub reward_signals: BTreeMap<String, RewardSignalSettings>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
}

fn default_max_steps() -> u64 {
    500_000
}

fn default_reward_signals() -> BTreeMap<String, RewardSignalSettings> {
    let mut signals = BTreeMap::new();
    signals.insert("extrinsic".to_string(), RewardSignalSettings::default());
    signals
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            trainer_type: TrainerType::default(),
            hyperparameters: SACSettings::default(),
            network_settings: NetworkSettings::default(),
            reward_signals: default_reward_signals(),
            max_steps: default_max_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerType {
    #[default]
    #[serde(rename = "sac")]
    SAC,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SACSettings {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub learning_rate_schedule: ScheduleType,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_tau")]
    pub tau: f64,
    #[serde(default = "default_init_entcoef")]
    pub init_entcoef: f64,

    // Diversity discriminator (MEDE)
    #[serde(default)]
    pub mede: bool,
    #[serde(default)]
    pub mede_use_actions: bool,
    #[serde(default)]
    pub mede_noise: bool,
    #[serde(default = "default_true")]
    pub mede_centered: bool,
    #[serde(default = "default_mutual_information")]
    pub mede_mutual_information: f64,
    #[serde(default = "default_mede_strength")]
    pub mede_strength: f64,
    #[serde(default)]
    pub mede_for_policy_loss: bool,
    #[serde(default)]
    pub mede_saliency_dropout: f64,
    #[serde(default)]
    pub mede_dropout: f64,
    #[serde(default)]
    pub mede_encoder_dropout: f64,
    #[serde(default)]
    pub mede_drop_actions: bool,
    #[serde(default)]
    pub mede_weight_decay: f64,
    #[serde(default = "default_hidden_units")]
    pub mede_hidden_units: i64,
}

fn default_learning_rate() -> f64 { 3e-4 }
fn default_batch_size() -> usize { 128 }
fn default_buffer_size() -> usize { 50_000 }
fn default_tau() -> f64 { 0.005 }
fn default_init_entcoef() -> f64 { 1.0 }
fn default_true() -> bool { true }
fn default_mutual_information() -> f64 { 0.5 }
fn default_mede_strength() -> f64 { 0.1 }
fn default_hidden_units() -> i64 { 128 }
fn default_num_layers() -> usize { 2 }
fn default_gamma() -> f64 { 0.99 }
fn default_strength() -> f64 { 1.0 }

impl Default for SACSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            learning_rate_schedule: ScheduleType::default(),
            batch_size: default_batch_size(),
            buffer_size: default_buffer_size(),
            tau: default_tau(),
            init_entcoef: default_init_entcoef(),
            mede: false,
            mede_use_actions: false,
            mede_noise: false,
            mede_centered: true,
            mede_mutual_information: default_mutual_information(),
            mede_strength: default_mede_strength(),
            mede_for_policy_loss: false,
            mede_saliency_dropout: 0.0,
            mede_dropout: 0.0,
            mede_encoder_dropout: 0.0,
            mede_drop_actions: false,
            mede_weight_decay: 0.0,
            mede_hidden_units: default_hidden_units(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleType {
    #[serde(rename = "linear")]
    Linear,
    #[default]
    #[serde(rename = "constant")]
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_hidden_units")]
    pub hidden_units: i64,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default)]
    pub normalize: bool,
    #[serde(default)]
    pub memory: Option<MemorySettings>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            hidden_units: default_hidden_units(),
            num_layers: default_num_layers(),
            normalize: false,
            memory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "default_memory_size")]
    pub memory_size: i64,
    #[serde(default = "default_sequence_length")]
    pub sequence_length: i64,
}

fn default_memory_size() -> i64 { 128 }
fn default_sequence_length() -> i64 { 64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSignalSettings {
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_strength")]
    pub strength: f64,
    /// Bootstrap through terminal steps for this stream.
    #[serde(default)]
    pub ignore_done: bool,
}

impl Default for RewardSignalSettings {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
            strength: default_strength(),
            ignore_done: false,
        }
    }
}

impl RunOptions {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn behavior(&self, name: &str) -> Result<&TrainerSettings> {
        self.behaviors.get(name).ok_or_else(|| {
            TrainerError::ConfigConflict(format!("no trainer config found for behavior: {}", name))
        })
    }
}
