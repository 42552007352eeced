// SAC (Soft Actor-Critic) Implementation
pub mod agent_action;
pub mod entropy;
pub mod mede;
pub mod model_utils;
pub mod networks;
pub mod optimizer;
pub mod reward_signals;
pub mod saliency;
pub mod specs;

pub use agent_action::{ActionLogProbs, AgentAction};
pub use entropy::{LogEntCoef, TargetEntropy};
pub use mede::{DiverseNetworkVariational, MedeLoss, MedeState};
pub use optimizer::SACOptimizer;
pub use reward_signals::{ExtrinsicRewardSignal, RewardSignal};
pub use saliency::SaliencyTracker;
pub use specs::{ActionSpec, BehaviorSpec, ObservationSpec, ObservationType};
