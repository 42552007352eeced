// SAC Optimizer Tests
mod common;

use rl_core::trainers::buffer::rewards_key;
use rl_core::trainers::settings::NetworkSettings;
use rl_core::{
    ActionSpec, AgentBuffer, BehaviorSpec, ObservationSpec, SACOptimizer, TorchPolicy, TrainerError,
};
use rl_core::trainers::TrainerSettings;
use tch::Device;

use common::{assert_all_finite, synthetic_batch};

fn mixed_spec() -> BehaviorSpec {
    BehaviorSpec::new(
        vec![ObservationSpec::vector("obs", 4)],
        ActionSpec::new(1, vec![2, 3]),
    )
}

fn build(spec: BehaviorSpec, settings: &TrainerSettings) -> SACOptimizer<TorchPolicy> {
    let network = NetworkSettings {
        hidden_units: 16,
        num_layers: 1,
        ..Default::default()
    };
    let policy = TorchPolicy::new(spec, network, Device::Cpu);
    SACOptimizer::new(policy, settings).expect("optimizer")
}

#[test]
fn test_single_update_on_mixed_action_space() {
    let spec = mixed_spec();
    let mut optimizer = build(spec.clone(), &TrainerSettings::default());
    let batch = synthetic_batch(&spec, 8, None);

    let stats = optimizer.update(&batch, 8).expect("update");
    println!("update stats: {:?}", stats);

    for key in [
        "Losses/Policy Loss",
        "Losses/Value Loss",
        "Losses/Q1 Loss",
        "Losses/Q2 Loss",
        "Policy/Discrete Entropy Coeff",
        "Policy/Continuous Entropy Coeff",
        "Policy/Learning Rate",
        "Policy/Entropy Loss",
    ] {
        assert!(stats.contains_key(key), "missing {}", key);
    }
    assert!(!stats.contains_key("Policy/MEDE Loss"));
    assert_all_finite(&stats);
    assert_eq!(optimizer.policy_optimizer_steps(), 1);
    assert_eq!(optimizer.value_optimizer_steps(), 1);
    assert_eq!(optimizer.entropy_optimizer_steps(), 1);
}

#[test]
fn test_repeated_updates_move_target_towards_critic() {
    let spec = BehaviorSpec::new(vec![ObservationSpec::vector("obs", 3)], ActionSpec::new(2, vec![]));
    let mut settings = TrainerSettings::default();
    settings.hyperparameters.tau = 0.5;
    let mut optimizer = build(spec.clone(), &settings);

    for _ in 0..3 {
        let batch = synthetic_batch(&spec, 16, None);
        let stats = optimizer.update(&batch, 16).expect("update");
        assert_all_finite(&stats);
    }
    assert_eq!(optimizer.policy_optimizer_steps(), 3);

    let source = optimizer.value_var_store().variables();
    let target = optimizer.target_var_store().variables();
    for (name, value) in &target {
        assert!(name.starts_with("value_network"));
        let gap = (&source[name] - value).abs().max().double_value(&[]);
        assert!(gap.is_finite());
    }
}

#[test]
fn test_infinite_reward_is_numerical_divergence() {
    let spec = mixed_spec();
    let mut optimizer = build(spec.clone(), &TrainerSettings::default());
    let batch = synthetic_batch(&spec, 8, None);

    let mut poisoned = AgentBuffer::new();
    for key in [
        rl_core::BufferKey::Obs(0),
        rl_core::BufferKey::NextObs(0),
        rl_core::BufferKey::ContinuousAction,
        rl_core::BufferKey::DiscreteAction,
        rl_core::BufferKey::ActionMask,
        rl_core::BufferKey::Masks,
        rl_core::BufferKey::Done,
    ] {
        for row in batch.column(&key).unwrap() {
            poisoned.append(key.clone(), row.clone());
        }
    }
    for _ in 0..8 {
        poisoned.append_scalar(rewards_key("extrinsic"), f32::INFINITY);
    }

    let result = optimizer.update(&poisoned, 8);
    assert!(matches!(result, Err(TrainerError::NumericalDivergence { .. })));
    assert_eq!(optimizer.policy_optimizer_steps(), 0);
    assert_eq!(optimizer.value_optimizer_steps(), 0);
}

#[test]
fn test_missing_column_is_reported() {
    let spec = mixed_spec();
    let mut optimizer = build(spec, &TrainerSettings::default());
    let result = optimizer.update(&AgentBuffer::new(), 0);
    assert!(matches!(result, Err(TrainerError::MissingColumn(_))));
}

#[test]
fn test_linear_schedule_reports_decayed_learning_rate() {
    let spec = BehaviorSpec::new(vec![ObservationSpec::vector("obs", 2)], ActionSpec::new(0, vec![3]));
    let mut settings = TrainerSettings::default();
    settings.max_steps = 100;
    settings.hyperparameters.learning_rate_schedule = rl_core::trainers::settings::ScheduleType::Linear;
    let mut optimizer = build(spec.clone(), &settings);
    optimizer.policy_mut().set_step(50);

    let stats = optimizer.update(&synthetic_batch(&spec, 8, None), 8).expect("update");
    let expected = (settings.hyperparameters.learning_rate - 1e-10) * 0.5 + 1e-10;
    assert!((stats["Policy/Learning Rate"] - expected).abs() < 1e-12);
}
