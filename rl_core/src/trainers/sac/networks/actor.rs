// Actor Network - tanh-squashed Gaussian and masked categorical heads
use tch::{nn, nn::Module, Kind, Tensor};

use super::body::NetworkBody;
use crate::trainers::sac::agent_action::{ActionLogProbs, AgentAction};
use crate::trainers::sac::model_utils::break_into_branches;
use crate::trainers::sac::specs::BehaviorSpec;
use crate::trainers::settings::NetworkSettings;

const LOG_STD_MIN: f64 = -20.0;
const LOG_STD_MAX: f64 = 2.0;
const EPSILON: f64 = 1e-6;
const MASKED_LOGIT: f64 = 1e8;

/// Output of one stochastic actor pass.
pub struct ActorOutput {
    pub actions: AgentAction,
    pub log_probs: ActionLogProbs,
    /// `(batch,)` summed entropy of the discrete branches.
    pub entropies: Tensor,
    pub memories: Option<Tensor>,
}

pub struct ActorNetwork {
    pub network_body: NetworkBody,
    mean_layer: Option<nn::Linear>,
    log_std_layer: Option<nn::Linear>,
    branch_layers: Vec<nn::Linear>,
    discrete_branches: Vec<i64>,
}

impl ActorNetwork {
    pub fn new(vs: &nn::Path, behavior_spec: &BehaviorSpec, settings: &NetworkSettings) -> Self {
        let network_body = NetworkBody::new(
            &(vs / "network_body"),
            &behavior_spec.observation_specs,
            settings,
            0,
        );
        let encoding = network_body.output_size();
        let action_spec = &behavior_spec.action_spec;

        let (mean_layer, log_std_layer) = if action_spec.has_continuous() {
            let size = action_spec.continuous_size;
            (
                Some(nn::linear(vs / "mean", encoding, size, Default::default())),
                Some(nn::linear(vs / "log_std", encoding, size, Default::default())),
            )
        } else {
            (None, None)
        };
        let branch_layers = action_spec
            .discrete_branches
            .iter()
            .enumerate()
            .map(|(i, &size)| nn::linear(vs / format!("branch_{}", i), encoding, size, Default::default()))
            .collect();

        Self {
            network_body,
            mean_layer,
            log_std_layer,
            branch_layers,
            discrete_branches: action_spec.discrete_branches.clone(),
        }
    }

    pub fn get_action_and_stats(
        &self,
        inputs: &[Tensor],
        masks: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: i64,
    ) -> ActorOutput {
        let (encoding, memories) = self.network_body.forward(inputs, None, memories, sequence_length);
        let batch = encoding.size()[0];
        let device = encoding.device();

        let (continuous_action, continuous_log_prob) = match (&self.mean_layer, &self.log_std_layer) {
            (Some(mean_layer), Some(log_std_layer)) => {
                let mean = mean_layer.forward(&encoding);
                let log_std = log_std_layer.forward(&encoding).clamp(LOG_STD_MIN, LOG_STD_MAX);
                Self::sample_squashed_gaussian(&mean, &log_std)
            }
            _ => (
                Tensor::zeros([batch, 0], (Kind::Float, device)),
                Tensor::zeros([batch, 0], (Kind::Float, device)),
            ),
        };

        let mut discrete_actions = Vec::with_capacity(self.branch_layers.len());
        let mut discrete_log_probs = Vec::with_capacity(self.branch_layers.len());
        let mut entropies = Tensor::zeros([batch], (Kind::Float, device));
        let branch_masks = masks.map(|m| break_into_branches(m, &self.discrete_branches));
        for (i, layer) in self.branch_layers.iter().enumerate() {
            let logits = layer.forward(&encoding);
            let logits = match &branch_masks {
                Some(branch_masks) => {
                    let mask = branch_masks[i].to_kind(Kind::Float);
                    logits - (1.0 - mask) * MASKED_LOGIT
                }
                None => logits,
            };
            let log_probs = logits.log_softmax(-1, Kind::Float);
            let probs = log_probs.exp();
            entropies = entropies - (&probs * &log_probs).sum_dim_intlist(&[1i64][..], false, Kind::Float);
            discrete_actions.push(tch::no_grad(|| probs.multinomial(1, true)));
            discrete_log_probs.push(log_probs);
        }
        let (discrete_tensor, all_discrete_tensor) = if discrete_actions.is_empty() {
            (
                Tensor::zeros([batch, 0], (Kind::Int64, device)),
                Tensor::zeros([batch, 0], (Kind::Float, device)),
            )
        } else {
            (Tensor::cat(&discrete_actions, 1), Tensor::cat(&discrete_log_probs, 1))
        };

        ActorOutput {
            actions: AgentAction {
                continuous_tensor: continuous_action,
                discrete_tensor,
            },
            log_probs: ActionLogProbs {
                continuous_tensor: continuous_log_prob,
                all_discrete_tensor,
            },
            entropies,
            memories,
        }
    }

    /// Reparameterized sample with per-dimension log-probabilities including
    /// the tanh correction.
    fn sample_squashed_gaussian(mean: &Tensor, log_std: &Tensor) -> (Tensor, Tensor) {
        let std = log_std.exp();
        let x_t = mean + &std * Tensor::randn_like(mean);
        let action = x_t.tanh();

        let var = &std * &std;
        let gaussian: Tensor = -0.5
            * ((&x_t - mean).pow_tensor_scalar(2) / &var + (2.0 * std::f64::consts::PI * &var).log());
        let tanh_correction = (1.0f64 - action.pow_tensor_scalar(2) + EPSILON).log();
        (action, gaussian - tanh_correction)
    }
}
