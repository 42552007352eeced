// MEDE - variational discriminator predicting the goal signal from the
// remaining observations, used as an intrinsic diversity reward
use tch::{nn, nn::Module, Kind, Tensor};
use tracing::{debug, warn};

use super::agent_action::{ActionLogProbs, AgentAction};
use super::model_utils::{break_into_branches, masked_mean};
use super::networks::body::NetworkBody;
use super::specs::{BehaviorSpec, ObservationSpec};
use crate::error::{Result, TrainerError};
use crate::trainers::settings::{NetworkSettings, SACSettings};

const EPSILON: f64 = 1e-7;
/// Step size of the dual ascent on `beta`.
const BETA_STEP: f64 = 0.0005;
const SIGMA_START: f64 = 0.5;
const DROPOUT_FLOOR: f64 = 0.0001;

/// What the encoder sees besides the non-goal observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderInput {
    ObservationsOnly,
    WithContinuousActions,
}

/// Shape of the prediction: one goal distribution, or one per discrete action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionHead {
    Single,
    PerBranch,
}

/// Cross-update state of the discriminator. Owned by the optimizer and lent
/// to the network on every call.
pub struct MedeState {
    /// Adaptive KL weight. Non-trainable, stored with the discriminator's
    /// parameters so it is checkpointed.
    pub beta: Tensor,
    /// Per-channel drop probability, one tensor per non-goal channel.
    pub observations_sal_drop: Vec<Tensor>,
    pub cont_actions_sal_drop: Tensor,
}

impl MedeState {
    pub fn beta(&self) -> f64 {
        self.beta.double_value(&[])
    }
}

/// Loss terms of one discriminator update. The variational terms are present
/// only in noise mode.
pub struct MedeLoss {
    pub total: Tensor,
    pub base: Tensor,
    pub kl: Option<Tensor>,
    pub vail: Option<Tensor>,
    pub beta: Option<f64>,
}

pub struct DiverseNetworkVariational {
    encoder: NetworkBody,
    encoder_input: EncoderInput,
    head: PredictionHead,
    z_sigma: Option<Tensor>,
    last_layer: nn::Linear,
    dropout: f64,
    encoder_dropout: f64,
    drop_actions: bool,
    max_saliency_dropout: f64,
    centered_reward: bool,
    mutual_information: f64,
    diverse_index: usize,
    diverse_size: i64,
    /// Original indices of the channels fed to the encoder.
    encoder_channels: Vec<usize>,
    discrete_branches: Vec<i64>,
}

impl DiverseNetworkVariational {
    /// Builds the discriminator and its initial state. The forward variant is
    /// fixed here from the action space and settings.
    pub fn new(
        path: &nn::Path,
        behavior_spec: &BehaviorSpec,
        hyperparameters: &SACSettings,
        network_settings: &NetworkSettings,
    ) -> Result<(Self, MedeState)> {
        let diverse_index = behavior_spec.goal_signal_index()?.ok_or_else(|| {
            TrainerError::ConfigConflict(
                "mede requires exactly one GOAL_SIGNAL observation".to_string(),
            )
        })?;
        let diverse_size = behavior_spec.observation_specs[diverse_index].flat_size();
        let action_spec = &behavior_spec.action_spec;

        if network_settings.memory.is_some() {
            warn!("memory was specified in network_settings but is not supported by the mede encoder, ignoring it");
        }
        let encoder_settings = NetworkSettings {
            hidden_units: hyperparameters.mede_hidden_units,
            num_layers: 1,
            normalize: true,
            memory: None,
        };

        let encoder_input = if hyperparameters.mede_use_actions && action_spec.has_continuous() {
            EncoderInput::WithContinuousActions
        } else {
            EncoderInput::ObservationsOnly
        };
        let head = if hyperparameters.mede_use_actions && action_spec.has_discrete() {
            PredictionHead::PerBranch
        } else {
            PredictionHead::Single
        };

        let (encoder_channels, encoder_specs): (Vec<usize>, Vec<ObservationSpec>) = behavior_spec
            .observation_specs
            .iter()
            .enumerate()
            .filter(|(_, spec)| !spec.is_goal_signal())
            .map(|(i, spec)| (i, spec.clone()))
            .unzip();

        let action_input_size = match encoder_input {
            EncoderInput::WithContinuousActions => action_spec.continuous_size,
            EncoderInput::ObservationsOnly => 0,
        };
        let encoder = NetworkBody::new(
            &(path / "encoder"),
            &encoder_specs,
            &encoder_settings,
            action_input_size,
        );
        let hidden = encoder.output_size();

        let z_sigma = hyperparameters
            .mede_noise
            .then(|| path.var("z_sigma", &[hidden], nn::Init::Const(SIGMA_START)));
        let outputs = match head {
            PredictionHead::PerBranch => diverse_size * action_spec.total_discrete_actions(),
            PredictionHead::Single => diverse_size,
        };
        let last_layer = nn::linear(path / "last_layer", hidden, outputs, Default::default());

        let device = path.device();
        let state = MedeState {
            beta: path.zeros_no_train("beta", &[]),
            observations_sal_drop: encoder_specs
                .iter()
                .map(|spec| Tensor::zeros([spec.flat_size()], (Kind::Float, device)))
                .collect(),
            cont_actions_sal_drop: Tensor::zeros([action_spec.continuous_size], (Kind::Float, device)),
        };

        debug!(
            ?encoder_input,
            ?head,
            diverse_size,
            noise = z_sigma.is_some(),
            "built mede discriminator"
        );

        let network = Self {
            encoder,
            encoder_input,
            head,
            z_sigma,
            last_layer,
            dropout: hyperparameters.mede_dropout,
            encoder_dropout: hyperparameters.mede_encoder_dropout,
            drop_actions: hyperparameters.mede_drop_actions,
            max_saliency_dropout: hyperparameters.mede_saliency_dropout,
            centered_reward: hyperparameters.mede_centered,
            mutual_information: hyperparameters.mede_mutual_information,
            diverse_index,
            diverse_size,
            encoder_channels,
            discrete_branches: action_spec.discrete_branches.clone(),
        };
        Ok((network, state))
    }

    pub fn diverse_index(&self) -> usize {
        self.diverse_index
    }

    pub fn diverse_size(&self) -> i64 {
        self.diverse_size
    }

    pub fn encoder_input(&self) -> EncoderInput {
        self.encoder_input
    }

    pub fn saliency_dropout_enabled(&self) -> bool {
        self.max_saliency_dropout > 0.0
    }

    /// Goal distribution(s) and the pre-noise encoding `mu`.
    pub fn predict(
        &self,
        inputs: &[Tensor],
        actions: &AgentAction,
        state: &MedeState,
        detach_action: bool,
        var_noise: bool,
    ) -> (Tensor, Tensor) {
        let observations: Vec<Tensor> = self
            .encoder_channels
            .iter()
            .map(|&i| inputs[i].shallow_clone())
            .collect();

        let hidden = match self.encoder_input {
            EncoderInput::WithContinuousActions => {
                let action = if detach_action {
                    actions.continuous_tensor.detach()
                } else {
                    actions.continuous_tensor.shallow_clone()
                };
                let (observations, action) = self.drop_inputs(observations, Some(action), state);
                self.encoder.forward(&observations, action.as_ref(), None, 1).0
            }
            EncoderInput::ObservationsOnly => {
                let (observations, _) = self.drop_inputs(observations, None, state);
                self.encoder.forward(&observations, None, None, 1).0
            }
        };
        let hidden = if self.encoder_dropout > 0.0 {
            hidden.dropout(self.encoder_dropout, true)
        } else {
            hidden
        };

        let z_mu = hidden;
        let z = match (&self.z_sigma, var_noise) {
            (Some(sigma), true) => &z_mu + sigma * Tensor::randn_like(&z_mu),
            _ => z_mu.shallow_clone(),
        };

        let logits = self.last_layer.forward(&z);
        let prediction = match self.head {
            PredictionHead::PerBranch => {
                let batch = logits.size()[0];
                logits
                    .view([batch, -1, self.diverse_size])
                    .softmax(-1, Kind::Float)
                    .view([batch, -1])
            }
            PredictionHead::Single => logits.softmax(1, Kind::Float),
        };
        (prediction, z_mu)
    }

    /// Saliency dropout when configured, plain dropout otherwise.
    fn drop_inputs(
        &self,
        observations: Vec<Tensor>,
        action: Option<Tensor>,
        state: &MedeState,
    ) -> (Vec<Tensor>, Option<Tensor>) {
        if self.saliency_dropout_enabled() {
            let observations = observations
                .iter()
                .zip(&state.observations_sal_drop)
                .map(|(obs, drop)| Self::saliency_mask(obs, drop))
                .collect();
            let action = match action {
                Some(a) if self.drop_actions => Some(Self::saliency_mask(&a, &state.cont_actions_sal_drop)),
                other => other,
            };
            (observations, action)
        } else if self.dropout > 0.0 {
            let observations = observations
                .iter()
                .map(|obs| obs.dropout(self.dropout, true))
                .collect();
            let action = match action {
                Some(a) if self.drop_actions => Some(a.dropout(self.dropout, true)),
                other => other,
            };
            (observations, action)
        } else {
            (observations, action)
        }
    }

    fn saliency_mask(input: &Tensor, drop: &Tensor) -> Tensor {
        let keep = input.rand_like().gt_tensor(drop).to_kind(Kind::Float);
        keep * input + DROPOUT_FLOOR
    }

    /// Log-likelihood the discriminator gives the true goal, `(batch,)`.
    pub fn rewards(
        &self,
        inputs: &[Tensor],
        actions: &AgentAction,
        log_probs: &ActionLogProbs,
        state: &MedeState,
        detach_action: bool,
        var_noise: bool,
    ) -> Tensor {
        let (prediction, _) = self.predict(inputs, actions, state, detach_action, var_noise);
        self.rewards_from_prediction(&prediction, &inputs[self.diverse_index], log_probs, detach_action)
    }

    fn rewards_from_prediction(
        &self,
        prediction: &Tensor,
        truth: &Tensor,
        log_probs: &ActionLogProbs,
        detach_action: bool,
    ) -> Tensor {
        let rewards = match self.head {
            PredictionHead::PerBranch => {
                let batch = prediction.size()[0];
                let per_action = (prediction.view([batch, -1, self.diverse_size]) * truth.unsqueeze(1))
                    .sum_dim_intlist(&[2i64][..], false, Kind::Float);
                let per_action = (per_action + EPSILON).log();

                let mut disc_probs = log_probs.all_discrete_tensor.exp();
                if self.dropout > 0.0 && self.drop_actions {
                    disc_probs = disc_probs.dropout(self.dropout, true);
                }
                if detach_action {
                    disc_probs = disc_probs.detach();
                }
                let branch_sums: Vec<Tensor> =
                    break_into_branches(&(per_action * disc_probs), &self.discrete_branches)
                        .iter()
                        .map(|b| b.sum_dim_intlist(&[1i64][..], false, Kind::Float))
                        .collect();
                Tensor::stack(&branch_sums, 0).mean_dim(&[0i64][..], false, Kind::Float)
            }
            PredictionHead::Single => {
                ((prediction * truth).sum_dim_intlist(&[1i64][..], false, Kind::Float) + EPSILON).log()
            }
        };
        if self.centered_reward {
            rewards + (self.diverse_size as f64).ln()
        } else {
            rewards
        }
    }

    /// Negative masked reward, plus the beta-weighted KL bottleneck in noise
    /// mode. Advances `beta` as a side effect.
    pub fn loss(
        &self,
        inputs: &[Tensor],
        actions: &AgentAction,
        log_probs: &ActionLogProbs,
        masks: &Tensor,
        state: &mut MedeState,
        detach_action: bool,
        var_noise: bool,
    ) -> MedeLoss {
        let (prediction, mu) = self.predict(inputs, actions, state, detach_action, var_noise);
        let rewards =
            self.rewards_from_prediction(&prediction, &inputs[self.diverse_index], log_probs, detach_action);
        let base = -masked_mean(&rewards, masks);

        let sigma = match &self.z_sigma {
            Some(sigma) => sigma,
            None => {
                return MedeLoss {
                    total: base.shallow_clone(),
                    base,
                    kl: None,
                    vail: None,
                    beta: None,
                }
            }
        };

        let sigma_sq = sigma.pow_tensor_scalar(2);
        let kl_terms: Tensor = 1.0 + sigma_sq.log() - 0.5 * mu.pow_tensor_scalar(2) - &sigma_sq;
        let kl = masked_mean(&-kl_terms.sum_dim_intlist(&[1i64][..], false, Kind::Float), masks);
        // beta is stepped in place below; the graph keeps a snapshot
        let beta = state.beta.detach().copy();
        let vail = &beta * (&kl - self.mutual_information);
        tch::no_grad(|| {
            let stepped = (&state.beta + BETA_STEP * (&kl - self.mutual_information)).clamp_min(0.0);
            state.beta.copy_(&stepped);
        });
        MedeLoss {
            total: &base + &vail,
            base,
            kl: Some(kl),
            vail: Some(vail),
            beta: Some(state.beta()),
        }
    }

    /// Rescales smoothed saliency into drop probabilities: the least salient
    /// entry gets 0, the most salient gets the configured maximum. Channels
    /// with no signal yet keep their previous rates.
    pub fn update_saliency(&self, sal_observations: &[Tensor], sal_cont_actions: &Tensor, state: &mut MedeState) {
        let non_goal = sal_observations
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.diverse_index)
            .map(|(_, sal)| sal);
        for (drop, sal) in state.observations_sal_drop.iter_mut().zip(non_goal) {
            if let Some(rescaled) = Self::rescale_saliency(sal, self.max_saliency_dropout) {
                *drop = rescaled;
            }
        }
        if let Some(rescaled) = Self::rescale_saliency(sal_cont_actions, self.max_saliency_dropout) {
            state.cont_actions_sal_drop = rescaled;
        }
    }

    fn rescale_saliency(saliency: &Tensor, max_dropout: f64) -> Option<Tensor> {
        if saliency.numel() == 0 || saliency.abs().sum(Kind::Float).double_value(&[]) == 0.0 {
            return None;
        }
        let shifted = saliency - saliency.min();
        let range = shifted.max().double_value(&[]);
        if range > 0.0 {
            Some(shifted / range * max_dropout)
        } else {
            Some(saliency.zeros_like())
        }
    }

    /// Mirrors the policy's normalization statistics onto the encoder,
    /// channel by channel.
    pub fn copy_normalization(&self, policy_body: &NetworkBody) {
        for (encoder_channel, &original) in self.encoder_channels.iter().enumerate() {
            self.encoder
                .copy_channel_normalization(encoder_channel, policy_body, original);
        }
    }
}
