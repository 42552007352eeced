use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rl_core::trainers::buffer::rewards_key;
use rl_core::trainers::TrainerSettings;
use rl_core::{
    ActionSpec, AgentBuffer, BehaviorSpec, BufferKey, CheckpointManager, ObservationSpec, Policy, RunOptions,
    SACOptimizer, TorchPolicy,
};
use std::collections::BTreeMap;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Drives SAC updates on synthetic experience for one configured behavior
#[derive(Parser, Debug)]
#[command(name = "sac-mede-bench", version, about = "Run SAC/MEDE updates on synthetic experience")]
struct Args {
    /// Trainer configuration YAML (defaults are used when omitted)
    #[arg(value_name = "trainer_config_path")]
    trainer_config_path: Option<String>,
    /// Behavior whose settings are used
    #[arg(long, default_value = "Bench")]
    behavior: String,
    #[arg(long, default_value_t = 10)]
    updates: usize,
    /// Overrides the configured batch size
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,
    #[arg(long = "obs-size", default_value_t = 8)]
    obs_size: i64,
    /// Size of the one-hot goal channel (0 for none)
    #[arg(long = "goal-size", default_value_t = 0)]
    goal_size: i64,
    #[arg(long = "continuous-size", default_value_t = 2)]
    continuous_size: i64,
    /// Discrete branch sizes, comma separated
    #[arg(long = "discrete-branches", value_delimiter = ',')]
    discrete_branches: Vec<i64>,
    /// Random seed for reproducibility (-1 for none)
    #[arg(long, default_value_t = -1)]
    seed: i64,
    /// Save a checkpoint after the last update
    #[arg(long)]
    checkpoint: bool,
    #[arg(long, help = "Enable debug-level logging")]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let run_options = match &args.trainer_config_path {
        Some(path) => RunOptions::from_yaml(path).with_context(|| format!("reading {}", path))?,
        None => RunOptions::default(),
    };
    let trainer_settings = match run_options.behaviors.get(&args.behavior) {
        Some(settings) => settings.clone(),
        None => {
            warn!(behavior = %args.behavior, "no trainer config for behavior, using defaults");
            TrainerSettings::default()
        }
    };
    let batch_size = args.batch_size.unwrap_or(trainer_settings.hyperparameters.batch_size);

    if args.seed >= 0 {
        tch::manual_seed(args.seed);
    }
    let mut rng = if args.seed >= 0 {
        StdRng::seed_from_u64(args.seed as u64)
    } else {
        StdRng::from_entropy()
    };

    let mut observation_specs = vec![ObservationSpec::vector("obs", args.obs_size)];
    if args.goal_size > 0 {
        observation_specs.push(ObservationSpec::goal_signal("goal", args.goal_size));
    }
    let behavior_spec = BehaviorSpec::new(
        observation_specs,
        ActionSpec::new(args.continuous_size, args.discrete_branches.clone()),
    );

    let device = run_options.torch_settings.device();
    let policy = TorchPolicy::new(behavior_spec.clone(), trainer_settings.network_settings.clone(), device);
    let sequence_length = policy.sequence_length().max(1) as usize;
    let memory_size = trainer_settings.network_settings.memory.map(|m| m.memory_size as usize);
    let mut optimizer = SACOptimizer::new(policy, &trainer_settings)?;

    println!("🧠 SAC configured (behavior={}, batch={}, mede={})",
        args.behavior, batch_size, trainer_settings.hyperparameters.mede);

    let replay = synthetic_buffer(&mut rng, &behavior_spec, batch_size * 4, memory_size);
    let mut last_stats = BTreeMap::new();
    for update in 0..args.updates {
        let batch = replay.sample_mini_batch(batch_size, sequence_length);
        let num_sequences = batch.num_experiences() / sequence_length;
        let stats = optimizer.update(&batch, num_sequences)?;
        optimizer.policy_mut().increment_step(batch.num_experiences() as u64);
        info!(
            update,
            policy_loss = stats["Losses/Policy Loss"],
            value_loss = stats["Losses/Value Loss"],
            "update done"
        );
        last_stats = stats;
    }

    for (name, value) in &last_stats {
        println!("  - {}: {:.5}", name, value);
    }

    if args.checkpoint {
        let settings = &run_options.checkpoint_settings;
        let manager = CheckpointManager::new(&settings.write_path, settings.keep_checkpoints)?;
        let step = optimizer.policy().get_current_step();
        let path = manager.save_checkpoint(&optimizer, step, &args.behavior)?;
        println!("💾 Checkpoint written to {}", path.display());
    }
    Ok(())
}

/// Uniform random transitions; goal channels are one-hot.
fn synthetic_buffer(
    rng: &mut StdRng,
    spec: &BehaviorSpec,
    rows: usize,
    memory_size: Option<usize>,
) -> AgentBuffer {
    let mut buffer = AgentBuffer::new();
    let action_spec = &spec.action_spec;
    for _ in 0..rows {
        for (i, obs_spec) in spec.observation_specs.iter().enumerate() {
            let size = obs_spec.flat_size() as usize;
            for key in [BufferKey::Obs(i), BufferKey::NextObs(i)] {
                let row = if obs_spec.is_goal_signal() {
                    let mut onehot = vec![0.0f32; size];
                    onehot[rng.gen_range(0..size)] = 1.0;
                    onehot
                } else {
                    (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect()
                };
                buffer.append(key, row);
            }
        }
        if action_spec.has_continuous() {
            let row = (0..action_spec.continuous_size).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            buffer.append(BufferKey::ContinuousAction, row);
        }
        if action_spec.has_discrete() {
            let row = action_spec
                .discrete_branches
                .iter()
                .map(|&k| rng.gen_range(0..k) as f32)
                .collect();
            buffer.append(BufferKey::DiscreteAction, row);
            buffer.append(BufferKey::ActionMask, vec![1.0; action_spec.total_discrete_actions() as usize]);
        }
        if let Some(memory_size) = memory_size {
            buffer.append(BufferKey::Memory, vec![0.0; memory_size]);
            buffer.append(BufferKey::CriticMemory, vec![0.0; memory_size]);
        }
        buffer.append_scalar(rewards_key("extrinsic"), rng.gen_range(-1.0..1.0));
        buffer.append_scalar(BufferKey::Masks, 1.0);
        buffer.append_scalar(BufferKey::Done, if rng.gen_bool(0.05) { 1.0 } else { 0.0 });
    }
    buffer
}
