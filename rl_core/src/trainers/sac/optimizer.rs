// SAC Optimizer - twin Q networks, value and target networks, entropy tuning
// and the optional MEDE diversity discriminator
use std::collections::BTreeMap;
use tch::{nn, Kind, Tensor};
use tracing::debug;

use super::agent_action::{ActionLogProbs, AgentAction};
use super::entropy::{LogEntCoef, TargetEntropy};
use super::mede::{DiverseNetworkVariational, MedeLoss, MedeState};
use super::model_utils::{
    actions_to_onehot, break_into_branches, masked_mean, soft_update, stacked_branch_sums, DecayedValue,
    FrozenParams, TrackedOptimizer,
};
use super::networks::q_network::PolicyValueNetwork;
use super::networks::value::{StreamValues, ValueNetwork};
use super::reward_signals::{create_reward_signals, RewardSignals};
use super::saliency::SaliencyTracker;
use super::specs::ActionSpec;
use crate::error::{Result, TrainerError};
use crate::trainers::buffer::{rewards_key, AgentBuffer, BufferKey};
use crate::trainers::checkpoint::{Checkpointable, ModuleRef, OptimizerState};
use crate::trainers::policy::Policy;
use crate::trainers::settings::TrainerSettings;

const MIN_LEARNING_RATE: f64 = 1e-10;

/// Discriminator, its optimizer and the state carried between updates.
struct MedeModule {
    var_store: nn::VarStore,
    network: DiverseNetworkVariational,
    optimizer: TrackedOptimizer,
    state: MedeState,
    saliency: SaliencyTracker,
    strength: f64,
    for_policy_loss: bool,
}

pub struct SACOptimizer<P: Policy> {
    policy: P,
    tau: f64,
    action_spec: ActionSpec,
    stream_names: Vec<String>,
    reward_signals: RewardSignals,
    gammas: BTreeMap<String, f64>,
    use_dones_in_backup: BTreeMap<String, f64>,

    value_vs: nn::VarStore,
    q_network: PolicyValueNetwork,
    critic: ValueNetwork,
    target_vs: nn::VarStore,
    target_network: ValueNetwork,

    log_ent_coef: LogEntCoef,
    target_entropy: TargetEntropy,
    decay_learning_rate: DecayedValue,
    policy_optimizer: TrackedOptimizer,
    value_optimizer: TrackedOptimizer,
    entropy_optimizer: TrackedOptimizer,
    /// Fold the value loss into the policy loss instead of the value step.
    shared_critic: bool,
    mede: Option<MedeModule>,
}

impl<P: Policy> SACOptimizer<P> {
    pub fn new(policy: P, trainer_settings: &TrainerSettings) -> Result<Self> {
        if policy.shared_critic() {
            return Err(TrainerError::ConfigConflict(
                "SAC does not support SharedActorCritic".to_string(),
            ));
        }
        let hyperparameters = &trainer_settings.hyperparameters;
        let behavior_spec = policy.behavior_spec().clone();
        let network_settings = policy.network_settings().clone();
        let action_spec = behavior_spec.action_spec.clone();
        let device = policy.device();

        let reward_signals = create_reward_signals(&trainer_settings.reward_signals)?;
        let stream_names: Vec<String> = reward_signals.keys().cloned().collect();
        let gammas = reward_signals
            .iter()
            .map(|(name, signal)| (name.clone(), signal.gamma()))
            .collect();
        let use_dones_in_backup = reward_signals
            .iter()
            .map(|(name, signal)| (name.clone(), if signal.ignore_done() { 0.0 } else { 1.0 }))
            .collect();

        let value_vs = nn::VarStore::new(device);
        let q_network = PolicyValueNetwork::new(
            &value_vs.root(),
            &stream_names,
            &behavior_spec.observation_specs,
            &network_settings,
            &action_spec,
        );
        let critic = ValueNetwork::new(
            &(value_vs.root() / "value_network"),
            &stream_names,
            &behavior_spec.observation_specs,
            &network_settings,
            0,
            1,
        );
        let target_vs = nn::VarStore::new(device);
        let target_network = ValueNetwork::new(
            &(target_vs.root() / "value_network"),
            &stream_names,
            &behavior_spec.observation_specs,
            &network_settings,
            0,
            1,
        );
        soft_update(&value_vs, &target_vs, 1.0)?;

        let log_ent_coef = LogEntCoef::new(&action_spec, hyperparameters.init_entcoef, device);
        let target_entropy = TargetEntropy::new(&action_spec);

        for (name, var) in policy.var_store().variables() {
            debug!(name = %name, shape = ?var.size(), "policy var");
        }
        for (name, var) in value_vs.variables() {
            debug!(name = %name, shape = ?var.size(), "value var");
        }

        let decay_learning_rate = DecayedValue::new(
            hyperparameters.learning_rate_schedule,
            hyperparameters.learning_rate,
            MIN_LEARNING_RATE,
            trainer_settings.max_steps,
        );
        let learning_rate = hyperparameters.learning_rate;
        let policy_optimizer = TrackedOptimizer::adam(policy.var_store(), learning_rate, 0.0)?;
        let value_optimizer = TrackedOptimizer::adam(&value_vs, learning_rate, 0.0)?;
        let entropy_optimizer = TrackedOptimizer::adam(&log_ent_coef.var_store, learning_rate, 0.0)?;

        let mede = if hyperparameters.mede {
            let var_store = nn::VarStore::new(device);
            let (network, state) = DiverseNetworkVariational::new(
                &var_store.root(),
                &behavior_spec,
                hyperparameters,
                &network_settings,
            )?;
            let optimizer =
                TrackedOptimizer::adam(&var_store, learning_rate, hyperparameters.mede_weight_decay)?;
            Some(MedeModule {
                var_store,
                network,
                optimizer,
                state,
                saliency: SaliencyTracker::new(&behavior_spec, device),
                strength: hyperparameters.mede_strength,
                for_policy_loss: hyperparameters.mede_for_policy_loss,
            })
        } else {
            None
        };

        Ok(Self {
            policy,
            tau: hyperparameters.tau,
            action_spec,
            stream_names,
            reward_signals,
            gammas,
            use_dones_in_backup,
            value_vs,
            q_network,
            critic,
            target_vs,
            target_network,
            log_ent_coef,
            target_entropy,
            decay_learning_rate,
            policy_optimizer,
            value_optimizer,
            entropy_optimizer,
            shared_critic: false,
            mede,
        })
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn policy_optimizer_steps(&self) -> u64 {
        self.policy_optimizer.steps()
    }

    pub fn value_optimizer_steps(&self) -> u64 {
        self.value_optimizer.steps()
    }

    pub fn entropy_optimizer_steps(&self) -> u64 {
        self.entropy_optimizer.steps()
    }

    pub fn mede_optimizer_steps(&self) -> Option<u64> {
        self.mede.as_ref().map(|m| m.optimizer.steps())
    }

    pub fn mede_beta(&self) -> Option<f64> {
        self.mede.as_ref().map(|m| m.state.beta())
    }

    pub fn target_entropy(&self) -> &TargetEntropy {
        &self.target_entropy
    }

    pub fn stream_names(&self) -> &[String] {
        &self.stream_names
    }

    pub fn q_network(&self) -> &PolicyValueNetwork {
        &self.q_network
    }

    pub fn critic(&self) -> &ValueNetwork {
        &self.critic
    }

    pub fn target_var_store(&self) -> &nn::VarStore {
        &self.target_vs
    }

    pub fn value_var_store(&self) -> &nn::VarStore {
        &self.value_vs
    }

    /// Smoothed saliency per observation channel, when MEDE is enabled.
    pub fn saliency(&self) -> Option<&SaliencyTracker> {
        self.mede.as_ref().map(|m| &m.saliency)
    }

    pub fn mede_state(&self) -> Option<&MedeState> {
        self.mede.as_ref().map(|m| &m.state)
    }

    /// Clipped double-Q loss per stream, averaged over streams.
    pub fn sac_q_loss(
        &self,
        q1_out: &StreamValues,
        q2_out: &StreamValues,
        target_values: &StreamValues,
        dones: &Tensor,
        rewards: &StreamValues,
        loss_masks: &Tensor,
    ) -> (Tensor, Tensor) {
        let mut q1_losses = Vec::with_capacity(self.stream_names.len());
        let mut q2_losses = Vec::with_capacity(self.stream_names.len());
        for name in &self.stream_names {
            let q1_stream = q1_out[name].reshape([-1]);
            let q2_stream = q2_out[name].reshape([-1]);
            let q_backup = tch::no_grad(|| {
                let not_done = 1.0 - self.use_dones_in_backup[name] * dones;
                &rewards[name] + not_done * self.gammas[name] * &target_values[name]
            });
            q1_losses.push(0.5 * masked_mean(&(&q_backup - q1_stream).square(), loss_masks));
            q2_losses.push(0.5 * masked_mean(&(&q_backup - q2_stream).square(), loss_masks));
        }
        (
            Tensor::stack(&q1_losses, 0).mean(Kind::Float),
            Tensor::stack(&q2_losses, 0).mean(Kind::Float),
        )
    }

    /// Value loss against the entropy-regularized minimum of both Q networks
    /// at the policy's actions. Fails on a non-finite result.
    pub fn sac_value_loss(
        &self,
        log_probs: &ActionLogProbs,
        values: &StreamValues,
        q1p_out: &StreamValues,
        q2p_out: &StreamValues,
        loss_masks: &Tensor,
        mede_rewards: Option<&Tensor>,
    ) -> Result<Tensor> {
        let branches = &self.action_spec.discrete_branches;
        let has_discrete = self.action_spec.has_discrete();
        let has_continuous = self.action_spec.has_continuous();
        let mede_bonus = |strength: f64| mede_rewards.map(|r| strength * r);

        let mut value_losses = Vec::with_capacity(self.stream_names.len());
        for name in &self.stream_names {
            let v_backup = tch::no_grad(|| {
                let cont_ent_coef = self.log_ent_coef.continuous();
                let disc_ent_coef = self.log_ent_coef.discrete();
                let cont_bonus = |keepdim: bool| {
                    (&cont_ent_coef * &log_probs.continuous_tensor).sum_dim_intlist(
                        &[1i64][..],
                        keepdim,
                        Kind::Float,
                    )
                };

                if !has_discrete {
                    let min_policy_q = q1p_out[name].minimum(&q2p_out[name]);
                    let mut v_backup = min_policy_q - cont_bonus(false);
                    if let Some(bonus) = mede_bonus(self.mede_strength()) {
                        v_backup += bonus;
                    }
                    v_backup
                } else {
                    let disc_log_probs = &log_probs.all_discrete_tensor;
                    let disc_action_probs = disc_log_probs.exp();
                    let q1p_mean = stacked_branch_sums(&break_into_branches(
                        &(&q1p_out[name] * &disc_action_probs),
                        branches,
                    ))
                    .mean_dim(&[0i64][..], false, Kind::Float);
                    let q2p_mean = stacked_branch_sums(&break_into_branches(
                        &(&q2p_out[name] * &disc_action_probs),
                        branches,
                    ))
                    .mean_dim(&[0i64][..], false, Kind::Float);
                    let min_policy_q = q1p_mean.minimum(&q2p_mean);

                    let branched_ent_bonus: Vec<Tensor> = break_into_branches(
                        &(disc_log_probs * &disc_action_probs),
                        branches,
                    )
                    .iter()
                    .enumerate()
                    .map(|(i, lp)| {
                        (disc_ent_coef.get(i as i64) * lp).sum_dim_intlist(&[1i64][..], true, Kind::Float)
                    })
                    .collect();
                    let ent_bonus = Tensor::stack(&branched_ent_bonus, 0).mean_dim(&[0i64][..], false, Kind::Float);

                    let mut v_backup = min_policy_q - ent_bonus;
                    if let Some(bonus) = mede_bonus(self.mede_strength()) {
                        v_backup += bonus.unsqueeze(-1);
                    }
                    if has_continuous {
                        v_backup -= cont_bonus(true);
                    }
                    v_backup.reshape([-1])
                }
            });
            let value_loss = 0.5 * masked_mean(&(&values[name] - v_backup).square(), loss_masks);
            value_losses.push(value_loss);
        }

        let value_loss = Tensor::stack(&value_losses, 0).mean(Kind::Float);
        ensure_finite("value", &value_loss)?;
        Ok(value_loss)
    }

    /// Entropy-regularized policy loss against Q1 at the policy's actions.
    pub fn sac_policy_loss(
        &self,
        log_probs: &ActionLogProbs,
        q1p_outs: &StreamValues,
        loss_masks: &Tensor,
        mede_rewards: Option<&Tensor>,
    ) -> Tensor {
        let cont_ent_coef = self.log_ent_coef.continuous().detach();
        let disc_ent_coef = self.log_ent_coef.discrete().detach();
        let branches = &self.action_spec.discrete_branches;

        let streams: Vec<Tensor> = q1p_outs.values().map(|q| q.shallow_clone()).collect();
        let mean_q1 = Tensor::stack(&streams, 0).mean_dim(&[0i64][..], false, Kind::Float);
        let batch = mean_q1.size()[0];
        let mut batch_policy_loss = Tensor::zeros([batch], (Kind::Float, mean_q1.device()));

        let all_mean_q1 = if self.action_spec.has_discrete() {
            let disc_log_probs = &log_probs.all_discrete_tensor;
            let disc_action_probs = disc_log_probs.exp();
            let branched_per_action_ent =
                break_into_branches(&(disc_log_probs * &disc_action_probs), branches);
            let branched_q_term = break_into_branches(&(&mean_q1 * &disc_action_probs), branches);
            let branched_policy_loss: Vec<Tensor> = branched_per_action_ent
                .iter()
                .zip(&branched_q_term)
                .enumerate()
                .map(|(i, (lp, qt))| {
                    (disc_ent_coef.get(i as i64) * lp - qt).sum_dim_intlist(&[1i64][..], false, Kind::Float)
                })
                .collect();
            batch_policy_loss = batch_policy_loss
                + Tensor::stack(&branched_policy_loss, 1).sum_dim_intlist(&[1i64][..], false, Kind::Float);
            (disc_action_probs * &mean_q1).sum_dim_intlist(&[1i64][..], false, Kind::Float)
        } else {
            mean_q1.shallow_clone()
        };

        if self.action_spec.has_continuous() {
            let cont_log_probs = &log_probs.continuous_tensor;
            batch_policy_loss = batch_policy_loss
                + (&cont_ent_coef * cont_log_probs - all_mean_q1.unsqueeze(1)).mean_dim(
                    &[1i64][..],
                    false,
                    Kind::Float,
                );
        }
        if let (Some(mede), Some(rewards)) = (&self.mede, mede_rewards) {
            if mede.for_policy_loss {
                batch_policy_loss = batch_policy_loss - mede.strength * rewards;
            }
        }
        masked_mean(&batch_policy_loss, loss_masks)
    }

    /// Temperature loss on the log coefficients; log-probabilities are inputs
    /// only.
    pub fn sac_entropy_loss(&self, log_probs: &ActionLogProbs, loss_masks: &Tensor) -> Tensor {
        let mut entropy_loss = Tensor::from(0.0f32).to_device(loss_masks.device());

        if self.action_spec.has_discrete() {
            let target_current_diff = tch::no_grad(|| {
                let disc_log_probs = &log_probs.all_discrete_tensor;
                let branched_per_action_ent = break_into_branches(
                    &(disc_log_probs * disc_log_probs.exp()),
                    &self.action_spec.discrete_branches,
                );
                let diffs: Vec<Tensor> = branched_per_action_ent
                    .iter()
                    .zip(&self.target_entropy.discrete)
                    .map(|(lp, &te)| lp.sum_dim_intlist(&[1i64][..], false, Kind::Float) + te)
                    .collect();
                Tensor::stack(&diffs, 1)
            });
            let weighted = (self.log_ent_coef.log_discrete() * target_current_diff).mean_dim(
                &[1i64][..],
                false,
                Kind::Float,
            );
            entropy_loss = entropy_loss - masked_mean(&weighted, loss_masks);
        }
        if self.action_spec.has_continuous() {
            let target_current_diff = tch::no_grad(|| {
                (&log_probs.continuous_tensor + self.target_entropy.continuous).sum_dim_intlist(
                    &[1i64][..],
                    false,
                    Kind::Float,
                )
            });
            entropy_loss = entropy_loss
                - masked_mean(&(self.log_ent_coef.log_continuous() * target_current_diff), loss_masks);
        }
        entropy_loss
    }

    /// Q value of the taken discrete action, averaged over branches, `(batch,)`.
    pub fn condense_q_streams(&self, q_output: &StreamValues, discrete_actions: &Tensor) -> StreamValues {
        let branches = &self.action_spec.discrete_branches;
        let onehot_actions = actions_to_onehot(discrete_actions, branches);
        q_output
            .iter()
            .map(|(name, q)| {
                let only_action_qs: Vec<Tensor> = onehot_actions
                    .iter()
                    .zip(break_into_branches(q, branches))
                    .map(|(act, branch_q)| (act * branch_q).sum_dim_intlist(&[1i64][..], false, Kind::Float))
                    .collect();
                let condensed = Tensor::stack(&only_action_qs, 0).mean_dim(&[0i64][..], false, Kind::Float);
                (name.clone(), condensed)
            })
            .collect()
    }

    fn mede_strength(&self) -> f64 {
        self.mede.as_ref().map_or(0.0, |m| m.strength)
    }

    fn stream_rewards(&self, batch: &AgentBuffer, device: tch::Device) -> Result<StreamValues> {
        self.stream_names
            .iter()
            .map(|name| Ok((name.clone(), batch.to_scalar_tensor(&rewards_key(name), device)?)))
            .collect()
    }

    fn observations(batch: &AgentBuffer, count: usize, next: bool, device: tch::Device) -> Result<Vec<Tensor>> {
        (0..count)
            .map(|i| {
                let key = if next { BufferKey::NextObs(i) } else { BufferKey::Obs(i) };
                batch.to_tensor(&key, device)
            })
            .collect()
    }

    /// Runs one full SAC update on a mini-batch of `num_sequences` sequences
    /// and returns the loss and coefficient stats.
    pub fn update(&mut self, batch: &AgentBuffer, num_sequences: usize) -> Result<BTreeMap<String, f64>> {
        let device = self.policy.device();
        let sequence_length = self.policy.sequence_length();
        let n_obs = self.policy.behavior_spec().observation_specs.len();

        let rewards = self.stream_rewards(batch, device)?;
        let current_obs = Self::observations(batch, n_obs, false, device)?;
        let next_obs = Self::observations(batch, n_obs, true, device)?;
        let act_masks = if batch.contains(&BufferKey::ActionMask) {
            Some(batch.to_tensor(&BufferKey::ActionMask, device)?)
        } else {
            None
        };
        let actions = AgentAction::from_buffer(batch, &self.action_spec, device)?;

        let stride = sequence_length.max(1) as usize;
        let memories = batch
            .strided_tensor(&BufferKey::Memory, stride, device)?
            .map(|m| m.unsqueeze(0));
        let value_memories = batch
            .strided_tensor(&BufferKey::CriticMemory, stride, device)?
            .map(|m| m.unsqueeze(0));
        // Q memories are zeroed; they are never recorded during inference.
        let q_memories = value_memories.as_ref().map(|m| m.zeros_like());

        let policy_body = self.policy.network_body();
        self.q_network.q1_network.network_body.copy_normalization(policy_body);
        self.q_network.q2_network.network_body.copy_normalization(policy_body);
        self.target_network.network_body.copy_normalization(policy_body);
        self.critic.network_body.copy_normalization(policy_body);

        let actor_output = self.policy.get_action_and_stats(
            &current_obs,
            act_masks.as_ref(),
            memories.as_ref(),
            sequence_length,
        );
        let sampled_actions = actor_output.actions;
        let log_probs = actor_output.log_probs;
        let (value_estimates, _) =
            self.critic
                .critic_pass(&current_obs, value_memories.as_ref(), sequence_length);

        let has_continuous = self.action_spec.has_continuous();
        let cont_sampled_actions = has_continuous.then(|| sampled_actions.continuous_tensor.shallow_clone());
        let cont_actions = has_continuous.then(|| actions.continuous_tensor.shallow_clone());

        // Gradient reaches the actor through the sampled actions only.
        let (q1p_out, q2p_out) = {
            let _frozen = FrozenParams::new(&self.value_vs);
            self.q_network.forward(
                &current_obs,
                cont_sampled_actions.as_ref(),
                q_memories.as_ref(),
                sequence_length,
                true,
                false,
            )
        };
        let (q1_out, q2_out) = self.q_network.forward(
            &current_obs,
            cont_actions.as_ref(),
            q_memories.as_ref(),
            sequence_length,
            true,
            true,
        );
        let (q1_stream, q2_stream) = if self.action_spec.has_discrete() {
            (
                self.condense_q_streams(&q1_out, &actions.discrete_tensor),
                self.condense_q_streams(&q2_out, &actions.discrete_tensor),
            )
        } else {
            (q1_out, q2_out)
        };

        let target_values = tch::no_grad(|| {
            // One critic step on the first observation of each sequence
            // yields the memories the target pass starts from.
            let next_value_memories = value_memories.as_ref().and_then(|vm| {
                let just_first_obs: Vec<Tensor> = current_obs
                    .iter()
                    .map(|obs| obs.slice(0, 0, None, sequence_length.max(1)))
                    .collect();
                self.critic.critic_pass(&just_first_obs, Some(vm), 1).1
            });
            self.target_network
                .critic_pass(&next_obs, next_value_memories.as_ref(), sequence_length)
                .0
        });
        let masks = batch.to_scalar_tensor(&BufferKey::Masks, device)?;
        let dones = batch.to_scalar_tensor(&BufferKey::Done, device)?;

        let (mede_value_rewards, mede_policy_rewards) = match &self.mede {
            Some(mede) => {
                mede.network.copy_normalization(policy_body);
                let policy_rewards =
                    mede.network
                        .rewards(&current_obs, &sampled_actions, &log_probs, &mede.state, false, false);
                let value_rewards = tch::no_grad(|| {
                    mede.network
                        .rewards(&current_obs, &sampled_actions, &log_probs, &mede.state, false, false)
                });
                (Some(value_rewards), Some(policy_rewards))
            }
            None => (None, None),
        };

        let (q1_loss, q2_loss) =
            self.sac_q_loss(&q1_stream, &q2_stream, &target_values, &dones, &rewards, &masks);
        ensure_finite("q1", &q1_loss)?;
        ensure_finite("q2", &q2_loss)?;
        let value_loss = self.sac_value_loss(
            &log_probs,
            &value_estimates,
            &q1p_out,
            &q2p_out,
            &masks,
            mede_value_rewards.as_ref(),
        )?;
        let mut policy_loss = self.sac_policy_loss(&log_probs, &q1p_out, &masks, mede_policy_rewards.as_ref());
        let entropy_loss = self.sac_entropy_loss(&log_probs, &masks);

        let mut total_value_loss = &q1_loss + &q2_loss;
        if self.shared_critic {
            policy_loss = policy_loss + &value_loss;
        } else {
            total_value_loss = total_value_loss + &value_loss;
        }

        let decay_lr = self.decay_learning_rate.get_value(self.policy.get_current_step());
        self.policy_optimizer.set_lr(decay_lr);
        self.policy_optimizer.backward_step(&policy_loss);

        self.value_optimizer.set_lr(decay_lr);
        self.value_optimizer.backward_step(&total_value_loss);

        self.entropy_optimizer.set_lr(decay_lr);
        self.entropy_optimizer.backward_step(&entropy_loss);

        soft_update(&self.value_vs, &self.target_vs, self.tau)?;

        let mut update_stats = BTreeMap::new();
        update_stats.insert("Losses/Policy Loss".to_string(), policy_loss.double_value(&[]));
        update_stats.insert("Losses/Value Loss".to_string(), value_loss.double_value(&[]));
        update_stats.insert("Losses/Q1 Loss".to_string(), q1_loss.double_value(&[]));
        update_stats.insert("Losses/Q2 Loss".to_string(), q2_loss.double_value(&[]));
        update_stats.insert(
            "Policy/Discrete Entropy Coeff".to_string(),
            self.log_ent_coef.discrete().mean(Kind::Float).double_value(&[]),
        );
        update_stats.insert(
            "Policy/Continuous Entropy Coeff".to_string(),
            self.log_ent_coef.continuous().mean(Kind::Float).double_value(&[]),
        );
        update_stats.insert("Policy/Learning Rate".to_string(), decay_lr);
        update_stats.insert("Policy/Entropy Loss".to_string(), entropy_loss.double_value(&[]));

        if let Some(mede) = self.mede.as_mut() {
            let MedeLoss {
                total,
                base,
                kl,
                vail,
                beta,
            } = mede.network.loss(
                &current_obs,
                &sampled_actions.detach(),
                &log_probs.detach(),
                &masks,
                &mut mede.state,
                true,
                true,
            );
            mede.optimizer.set_lr(decay_lr);
            mede.optimizer.backward_step(&total);

            if mede.network.saliency_dropout_enabled() {
                mede.saliency.refresh(
                    &self.value_vs,
                    &self.q_network,
                    &current_obs,
                    cont_sampled_actions.as_ref(),
                    q_memories.as_ref(),
                    sequence_length,
                    &mede.network,
                    &mut mede.state,
                );
            }

            update_stats.insert("Policy/MEDE Loss".to_string(), total.double_value(&[]));
            update_stats.insert("Policy/MEDE Base".to_string(), base.double_value(&[]));
            update_stats.insert(
                "Policy/MEDE Variational".to_string(),
                vail.map_or(0.0, |v| v.double_value(&[])),
            );
            update_stats.insert("Policy/MEDE KL".to_string(), kl.map_or(0.0, |k| k.double_value(&[])));
            update_stats.insert("Policy/MEDE beta".to_string(), beta.unwrap_or(0.0));
        }

        debug!(num_sequences, stats = ?update_stats, "sac update");
        Ok(update_stats)
    }

    /// Trains every reward provider that has a mini-batch.
    pub fn update_reward_signals(
        &mut self,
        reward_signal_minibatches: &BTreeMap<String, AgentBuffer>,
    ) -> Result<BTreeMap<String, f64>> {
        let mut update_stats = BTreeMap::new();
        for (name, update_buffer) in reward_signal_minibatches {
            if let Some(signal) = self.reward_signals.get_mut(name) {
                update_stats.extend(signal.update(update_buffer)?);
            }
        }
        Ok(update_stats)
    }
}

/// Aborts the update before any optimizer step sees a NaN or infinite loss.
fn ensure_finite(loss: &'static str, tensor: &Tensor) -> Result<()> {
    let value = tensor.double_value(&[]);
    if value.is_finite() {
        Ok(())
    } else {
        Err(TrainerError::NumericalDivergence { loss, value })
    }
}

impl<P: Policy> Checkpointable for SACOptimizer<P> {
    fn get_modules(&self) -> Vec<(String, ModuleRef<'_>)> {
        let mut modules = vec![
            (
                "Optimizer:q_network".to_string(),
                ModuleRef::Variables {
                    store: &self.value_vs,
                    scopes: &["q1_network", "q2_network"],
                },
            ),
            (
                "Optimizer:value_network".to_string(),
                ModuleRef::Variables {
                    store: &self.value_vs,
                    scopes: &["value_network"],
                },
            ),
            (
                "Optimizer:target_network".to_string(),
                ModuleRef::Variables {
                    store: &self.target_vs,
                    scopes: &[],
                },
            ),
            (
                "Optimizer:entropy_coefficients".to_string(),
                ModuleRef::Variables {
                    store: &self.log_ent_coef.var_store,
                    scopes: &[],
                },
            ),
            ("Optimizer:policy_optimizer".to_string(), ModuleRef::Optimizer(&self.policy_optimizer)),
            ("Optimizer:value_optimizer".to_string(), ModuleRef::Optimizer(&self.value_optimizer)),
            ("Optimizer:entropy_optimizer".to_string(), ModuleRef::Optimizer(&self.entropy_optimizer)),
        ];
        if let Some(mede) = &self.mede {
            modules.push(("Optimizer:mede_optimizer".to_string(), ModuleRef::Optimizer(&mede.optimizer)));
            modules.push((
                "Optimizer:mede_network".to_string(),
                ModuleRef::Variables {
                    store: &mede.var_store,
                    scopes: &[],
                },
            ));
        }
        for signal in self.reward_signals.values() {
            for (name, store) in signal.get_modules() {
                modules.push((name, ModuleRef::Variables { store, scopes: &[] }));
            }
        }
        modules
    }

    fn restore_optimizer(&mut self, name: &str, state: &OptimizerState) {
        let optimizer = match name {
            "Optimizer:policy_optimizer" => Some(&mut self.policy_optimizer),
            "Optimizer:value_optimizer" => Some(&mut self.value_optimizer),
            "Optimizer:entropy_optimizer" => Some(&mut self.entropy_optimizer),
            "Optimizer:mede_optimizer" => self.mede.as_mut().map(|m| &mut m.optimizer),
            _ => None,
        };
        if let Some(optimizer) = optimizer {
            optimizer.set_steps(state.steps);
            optimizer.set_lr(state.learning_rate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::policy::TorchPolicy;
    use crate::trainers::sac::specs::{ActionSpec, BehaviorSpec, ObservationSpec};
    use crate::trainers::settings::NetworkSettings;
    use tch::Device;

    fn optimizer(action_spec: ActionSpec) -> SACOptimizer<TorchPolicy> {
        let spec = BehaviorSpec::new(vec![ObservationSpec::vector("obs", 3)], action_spec);
        let policy = TorchPolicy::new(spec, NetworkSettings::default(), Device::Cpu);
        SACOptimizer::new(policy, &TrainerSettings::default()).unwrap()
    }

    fn mede_optimizer(for_policy_loss: bool) -> SACOptimizer<TorchPolicy> {
        let spec = BehaviorSpec::new(
            vec![ObservationSpec::vector("obs", 3), ObservationSpec::goal_signal("goal", 2)],
            ActionSpec::new(1, vec![]),
        );
        let policy = TorchPolicy::new(spec, NetworkSettings::default(), Device::Cpu);
        let mut settings = TrainerSettings::default();
        settings.hyperparameters.mede = true;
        settings.hyperparameters.mede_strength = 0.1;
        settings.hyperparameters.mede_for_policy_loss = for_policy_loss;
        SACOptimizer::new(policy, &settings).unwrap()
    }

    fn extrinsic(values: Tensor) -> StreamValues {
        let mut streams = StreamValues::new();
        streams.insert("extrinsic".to_string(), values);
        streams
    }

    fn row(values: &[f32], rows: i64) -> Tensor {
        Tensor::from_slice(values).reshape([rows, -1])
    }

    #[test]
    fn test_condense_averages_selected_branch_values() {
        let optimizer = optimizer(ActionSpec::new(0, vec![3, 2]));
        let mut q = StreamValues::new();
        q.insert(
            "extrinsic".to_string(),
            Tensor::from_slice(&[0.5f32, 2.0, -1.0, 4.0, 7.0]).reshape([1, 5]),
        );
        let actions = Tensor::from_slice(&[1i64, 0]).reshape([1, 2]);
        let condensed = optimizer.condense_q_streams(&q, &actions);
        let value = condensed["extrinsic"].double_value(&[0]);
        assert!((value - (2.0 + 4.0) / 2.0).abs() < 1e-6);
        assert_eq!(condensed["extrinsic"].size(), vec![1]);
    }

    #[test]
    fn test_shared_critic_is_rejected() {
        let spec = BehaviorSpec::new(vec![ObservationSpec::vector("obs", 3)], ActionSpec::new(1, vec![]));
        let policy = TorchPolicy::new(spec, NetworkSettings::default(), Device::Cpu).with_shared_critic(true);
        assert!(matches!(
            SACOptimizer::new(policy, &TrainerSettings::default()),
            Err(TrainerError::ConfigConflict(_))
        ));
    }

    #[test]
    fn test_target_starts_as_hard_copy() {
        let optimizer = optimizer(ActionSpec::new(2, vec![]));
        let source = optimizer.value_var_store().variables();
        for (name, target) in optimizer.target_var_store().variables() {
            let diff = (&source[&name] - &target).abs().max().double_value(&[]);
            assert_eq!(diff, 0.0, "{}", name);
        }
    }

    #[test]
    fn test_q_loss_respects_ignore_done() {
        let optimizer = optimizer(ActionSpec::new(1, vec![]));
        let mut q = StreamValues::new();
        q.insert("extrinsic".to_string(), Tensor::zeros([2], (Kind::Float, Device::Cpu)));
        let mut target = StreamValues::new();
        target.insert("extrinsic".to_string(), Tensor::ones([2], (Kind::Float, Device::Cpu)));
        let mut rewards = StreamValues::new();
        rewards.insert("extrinsic".to_string(), Tensor::zeros([2], (Kind::Float, Device::Cpu)));
        let dones = Tensor::ones([2], (Kind::Float, Device::Cpu));
        let masks = Tensor::ones([2], (Kind::Float, Device::Cpu));

        // terminal steps cut the bootstrap: backup is the zero reward
        let (q1_loss, q2_loss) = optimizer.sac_q_loss(&q, &q, &target, &dones, &rewards, &masks);
        assert_eq!(q1_loss.double_value(&[]), 0.0);
        assert_eq!(q2_loss.double_value(&[]), 0.0);

        let not_done = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let (q1_loss, _) = optimizer.sac_q_loss(&q, &q, &target, &not_done, &rewards, &masks);
        let gamma = 0.99f64;
        assert!((q1_loss.double_value(&[]) - 0.5 * gamma * gamma).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_value_loss_is_divergence() {
        let optimizer = optimizer(ActionSpec::new(1, vec![]));
        let mut values = StreamValues::new();
        values.insert("extrinsic".to_string(), Tensor::zeros([3], (Kind::Float, Device::Cpu)));
        let mut q1p = StreamValues::new();
        q1p.insert("extrinsic".to_string(), Tensor::full([3], f64::INFINITY, (Kind::Float, Device::Cpu)));
        let log_probs = ActionLogProbs {
            continuous_tensor: Tensor::zeros([3, 1], (Kind::Float, Device::Cpu)),
            all_discrete_tensor: Tensor::zeros([3, 0], (Kind::Float, Device::Cpu)),
        };
        let masks = Tensor::ones([3], (Kind::Float, Device::Cpu));
        let result = optimizer.sac_value_loss(&log_probs, &values, &q1p, &q1p, &masks, None);
        assert!(matches!(
            result,
            Err(TrainerError::NumericalDivergence { loss: "value", .. })
        ));
    }

    #[test]
    fn test_entropy_loss_has_no_policy_gradient() {
        let optimizer = optimizer(ActionSpec::new(2, vec![3]));
        let log_probs = ActionLogProbs {
            continuous_tensor: Tensor::full([4, 2], -0.5, (Kind::Float, Device::Cpu)).set_requires_grad(true),
            all_discrete_tensor: Tensor::full([4, 3], -(3f64.ln()), (Kind::Float, Device::Cpu))
                .set_requires_grad(true),
        };
        let masks = Tensor::ones([4], (Kind::Float, Device::Cpu));
        let loss = optimizer.sac_entropy_loss(&log_probs, &masks);
        loss.backward();
        assert!(!log_probs.continuous_tensor.grad().defined());
        assert!(!log_probs.all_discrete_tensor.grad().defined());
        assert!(optimizer.log_ent_coef.log_continuous().grad().defined());
    }

    // Loss Formula Tests

    #[test]
    fn test_continuous_policy_loss_value() {
        let optimizer = optimizer(ActionSpec::new(2, vec![]));
        let log_probs = ActionLogProbs {
            continuous_tensor: row(&[-0.5, -1.5, 0.0, -1.0], 2),
            all_discrete_tensor: Tensor::zeros([2, 0], (Kind::Float, Device::Cpu)),
        };
        let q1p = extrinsic(Tensor::from_slice(&[1.0f32, 2.0]));
        let masks = Tensor::ones([2], (Kind::Float, Device::Cpu));

        // alpha = 1: rows give mean(-1.5, -2.5) and mean(-2.0, -3.0)
        let loss = optimizer.sac_policy_loss(&log_probs, &q1p, &masks, None);
        assert!((loss.double_value(&[]) - (-2.25)).abs() < 1e-6);
    }

    #[test]
    fn test_discrete_policy_loss_value() {
        let optimizer = optimizer(ActionSpec::new(0, vec![2]));
        let probs = [0.25f64, 0.75];
        let log_probs = ActionLogProbs {
            continuous_tensor: Tensor::zeros([1, 0], (Kind::Float, Device::Cpu)),
            all_discrete_tensor: row(&[probs[0].ln() as f32, probs[1].ln() as f32], 1),
        };
        let q1p = extrinsic(row(&[2.0, 4.0], 1));
        let masks = Tensor::ones([1], (Kind::Float, Device::Cpu));

        let loss = optimizer.sac_policy_loss(&log_probs, &q1p, &masks, None);
        let entropy_term: f64 = probs.iter().map(|p| p * p.ln()).sum();
        let expected = entropy_term - (0.25 * 2.0 + 0.75 * 4.0);
        assert!((loss.double_value(&[]) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_discrete_value_backup_uses_weighted_min_q() {
        let optimizer = optimizer(ActionSpec::new(0, vec![2]));
        let probs = [0.25f64, 0.75];
        let log_probs = ActionLogProbs {
            continuous_tensor: Tensor::zeros([1, 0], (Kind::Float, Device::Cpu)),
            all_discrete_tensor: row(&[probs[0].ln() as f32, probs[1].ln() as f32], 1),
        };
        let values = extrinsic(Tensor::zeros([1], (Kind::Float, Device::Cpu)));
        let q1p = extrinsic(row(&[2.0, 4.0], 1));
        let q2p = extrinsic(row(&[3.0, 1.0], 1));
        let masks = Tensor::ones([1], (Kind::Float, Device::Cpu));

        // weighted Q1 = 3.5, weighted Q2 = 1.5
        let loss = optimizer
            .sac_value_loss(&log_probs, &values, &q1p, &q2p, &masks, None)
            .unwrap();
        let entropy_term: f64 = probs.iter().map(|p| p * p.ln()).sum();
        let backup = 1.5 - entropy_term;
        assert!((loss.double_value(&[]) - 0.5 * backup * backup).abs() < 1e-5);
    }

    #[test]
    fn test_mede_bonus_raises_value_backup() {
        let optimizer = mede_optimizer(false);
        let log_probs = ActionLogProbs {
            continuous_tensor: Tensor::zeros([2, 1], (Kind::Float, Device::Cpu)),
            all_discrete_tensor: Tensor::zeros([2, 0], (Kind::Float, Device::Cpu)),
        };
        let values = extrinsic(Tensor::full([2], 0.1, (Kind::Float, Device::Cpu)));
        let q = extrinsic(Tensor::zeros([2], (Kind::Float, Device::Cpu)));
        let masks = Tensor::ones([2], (Kind::Float, Device::Cpu));
        let mede_rewards = Tensor::ones([2], (Kind::Float, Device::Cpu));

        // backup = 0 + 0.1 * 1 matches the value exactly
        let with_bonus = optimizer
            .sac_value_loss(&log_probs, &values, &q, &q, &masks, Some(&mede_rewards))
            .unwrap();
        assert!(with_bonus.double_value(&[]).abs() < 1e-10);
        let without = optimizer
            .sac_value_loss(&log_probs, &values, &q, &q, &masks, None)
            .unwrap();
        assert!((without.double_value(&[]) - 0.005).abs() < 1e-7);
    }

    #[test]
    fn test_mede_policy_term_follows_flag() {
        let log_probs = ActionLogProbs {
            continuous_tensor: Tensor::full([2, 1], -0.3, (Kind::Float, Device::Cpu)),
            all_discrete_tensor: Tensor::zeros([2, 0], (Kind::Float, Device::Cpu)),
        };
        let q1p = extrinsic(Tensor::from_slice(&[0.5f32, -0.5]));
        let masks = Tensor::ones([2], (Kind::Float, Device::Cpu));
        let mede_rewards = Tensor::full([2], 2.0, (Kind::Float, Device::Cpu));

        for (for_policy_loss, shift) in [(true, -0.2), (false, 0.0)] {
            let optimizer = mede_optimizer(for_policy_loss);
            let without = optimizer.sac_policy_loss(&log_probs, &q1p, &masks, None).double_value(&[]);
            let with = optimizer
                .sac_policy_loss(&log_probs, &q1p, &masks, Some(&mede_rewards))
                .double_value(&[]);
            assert!((with - without - shift).abs() < 1e-6, "flag {}", for_policy_loss);
        }
    }
}
