//! Full runs with the Dreamer player and learners.
#![cfg(feature = "torch")]

use dreamrl::comm::{BackendRegistry, RunSetup};
use dreamrl::config::RunConfig;
use dreamrl::coordinator::launch_local;
use dreamrl::dreamer::{DreamerLearner, DreamerPlayer};
use dreamrl::env::{DreamEnv, EnvInfo, ObsDict, StepResult};
use dreamrl::log::{MetricLogger, Metrics};
use dreamrl::spaces::{Box as BoxSpace, Dict, Discrete, DynSpace};
use dreamrl::vector::{Serial, VecEnvBackend};
use dreamrl::Result;
use ndarray::{ArrayD, IxDyn};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

/// Rewards action 1; episodes last six steps.
struct Chain {
    t: u32,
}

impl Chain {
    fn obs(&self) -> ObsDict {
        let mut state = ArrayD::zeros(IxDyn(&[3]));
        state[[0]] = self.t as f32 / 6.0;
        state[[1]] = 1.0;
        ObsDict::from([("state".to_string(), state)])
    }
}

impl DreamEnv for Chain {
    fn observation_space(&self) -> Dict {
        Dict::from_pairs(vec![("state", DynSpace::Box(BoxSpace::uniform(&[3], 0.0, 1.0)))])
    }

    fn action_space(&self) -> DynSpace {
        DynSpace::Discrete(Discrete::new(2))
    }

    fn reset(&mut self, _seed: Option<u64>) -> Result<(ObsDict, EnvInfo)> {
        self.t = 0;
        Ok((self.obs(), EnvInfo::new()))
    }

    fn step(&mut self, action: &ArrayD<f32>) -> Result<StepResult> {
        self.t += 1;
        let reward = action.iter().next().copied().unwrap_or(0.0);
        Ok(StepResult {
            observation: self.obs(),
            reward,
            terminated: self.t >= 6,
            truncated: false,
            info: EnvInfo::new(),
        })
    }
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<(u64, Metrics)>>>);

impl MetricLogger for Collect {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        let metrics = Metrics::from([(name.to_string(), value)]);
        self.0.lock().unwrap().push((step, metrics));
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) {
        self.0.lock().unwrap().push((step, metrics.clone()));
    }
}

fn run_config(root: &Path) -> RunConfig {
    let mut config = RunConfig::default()
        .tiny()
        .with_env("chain", 2)
        .with_world_size(3)
        .with_total_steps(32)
        .with_root_dir(root);
    config.algo.learning_starts = 8;
    config.algo.train_every = 4;
    config.buffer.size = 64;
    config.buffer.checkpoint = true;
    config.checkpoint.every = 16;
    config.metric.log_every = 8;
    config.distributed.timeout_secs = 120;
    config
}

fn envs() -> Serial<Chain> {
    Serial::new(|_| Ok(Chain { t: 0 }), 2).unwrap()
}

fn player(config: &RunConfig) -> DreamerPlayer {
    let envs = envs();
    let setup = RunSetup {
        config: config.clone(),
        observation_space: envs.observation_space(),
        action_space: envs.action_space(),
    };
    DreamerPlayer::new(&setup).unwrap()
}

#[test]
fn test_dreamer_run_and_resume() {
    let dir = tempdir().unwrap();
    let config = run_config(dir.path());
    let logs = Collect::default();

    let summary = launch_local(
        &BackendRegistry::with_defaults(),
        config.clone(),
        envs(),
        player(&config),
        Box::new(logs.clone()),
        |setup, rank| DreamerLearner::new(setup, rank),
    )
    .unwrap();

    assert_eq!(summary.player.policy_step, 32);
    assert_eq!(summary.player.training_rounds, 7);
    assert_eq!(summary.learners.len(), 2);
    for learner in &summary.learners {
        assert_eq!(learner.gradient_steps, 7);
    }

    let logs = logs.0.lock().unwrap();
    let trained: Vec<&Metrics> = logs
        .iter()
        .map(|(_, m)| m)
        .filter(|m| m.contains_key("Loss/world_model_loss"))
        .collect();
    assert!(!trained.is_empty());
    for metrics in trained {
        for key in ["Loss/world_model_loss", "Loss/policy_loss", "Loss/value_loss", "State/kl"] {
            assert!(metrics[key].is_finite(), "{key} = {}", metrics[key]);
        }
    }

    let mid = config.run_dir().join("checkpoint").join("ckpt_16_0.ckpt");
    assert!(mid.exists());
    let resumed = config.clone().with_resume_from(&mid);
    let summary = launch_local(
        &BackendRegistry::with_defaults(),
        resumed,
        envs(),
        player(&config),
        Box::new(Collect::default()),
        |setup, rank| DreamerLearner::new(setup, rank),
    )
    .unwrap();
    assert_eq!(summary.player.policy_step, 32);
    assert_eq!(summary.player.training_rounds, 3);
}
