// Trainers Module

pub mod buffer;
pub mod checkpoint;
pub mod policy;
pub mod settings;

// SAC Implementation
pub mod sac;

pub use buffer::{AgentBuffer, BufferKey};
pub use checkpoint::{CheckpointManager, Checkpointable};
pub use policy::{Policy, TorchPolicy};
pub use settings::{RunOptions, TrainerSettings};
