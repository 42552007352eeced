// Shared fixtures for the optimizer integration tests
#![allow(dead_code)]

use rand::Rng;
use rl_core::trainers::buffer::rewards_key;
use rl_core::{AgentBuffer, BehaviorSpec, BufferKey};

/// Random transitions shaped for `spec`. GOAL_SIGNAL channels get a one-hot
/// row; every step is valid and non-terminal.
pub fn synthetic_batch(spec: &BehaviorSpec, rows: usize, memory_size: Option<usize>) -> AgentBuffer {
    let mut rng = rand::thread_rng();
    let mut batch = AgentBuffer::new();
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
                batch.append(key, row);
            }
        }
        if action_spec.has_continuous() {
            let continuous = (0..action_spec.continuous_size)
                .map(|_| rng.gen_range(-1.0f32..1.0))
                .collect();
            batch.append(BufferKey::ContinuousAction, continuous);
        }
        if action_spec.has_discrete() {
            let discrete = action_spec
                .discrete_branches
                .iter()
                .map(|&k| rng.gen_range(0..k) as f32)
                .collect();
            batch.append(BufferKey::DiscreteAction, discrete);
            batch.append(
                BufferKey::ActionMask,
                vec![1.0; action_spec.total_discrete_actions() as usize],
            );
        }
        if let Some(memory_size) = memory_size {
            batch.append(BufferKey::Memory, vec![0.0; memory_size]);
            batch.append(BufferKey::CriticMemory, vec![0.0; memory_size]);
        }
        batch.append_scalar(rewards_key("extrinsic"), rng.gen_range(-1.0..1.0));
        batch.append_scalar(BufferKey::Masks, 1.0);
        batch.append_scalar(BufferKey::Done, 0.0);
    }
    batch
}

pub fn assert_all_finite(stats: &std::collections::BTreeMap<String, f64>) {
    for (name, value) in stats {
        assert!(value.is_finite(), "{} is {}", name, value);
    }
}
