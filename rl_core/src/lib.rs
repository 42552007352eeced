// SAC core library - Soft Actor-Critic updates with the MEDE diversity objective

pub mod error;
pub mod trainers;

// Re-export main types
pub use error::{Result, TrainerError};
pub use trainers::sac::{ActionSpec, BehaviorSpec, ObservationSpec, SACOptimizer};
pub use trainers::{AgentBuffer, BufferKey, CheckpointManager, Policy, RunOptions, TorchPolicy};
