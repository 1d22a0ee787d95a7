//! Run configuration.
//!
//! Loaded from JSON; every section has defaults so a file only needs the
//! values it changes. Learning rates honour `DREAMRL_WORLD_LR`,
//! `DREAMRL_ACTOR_LR` and `DREAMRL_CRITIC_LR`.

use crate::comm::DistributedConfig;
use crate::{DreamError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    pub run_name: String,
    /// Logs and checkpoints go to `<root_dir>/<run_name>`
    pub root_dir: PathBuf,
    /// Run a single update and exit
    pub dry_run: bool,
    /// Fail on non-finite gradient norms instead of skipping the clip
    pub strict_gradients: bool,
    pub env: EnvConfig,
    pub buffer: BufferConfig,
    pub checkpoint: CheckpointSection,
    pub metric: MetricConfig,
    pub distributed: DistributedConfig,
    pub algo: AlgoConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            run_name: "default".to_string(),
            root_dir: PathBuf::from("logs/runs"),
            dry_run: false,
            strict_gradients: false,
            env: EnvConfig::default(),
            buffer: BufferConfig::default(),
            checkpoint: CheckpointSection::default(),
            metric: MetricConfig::default(),
            distributed: DistributedConfig::default(),
            algo: AlgoConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub id: String,
    pub num_envs: usize,
    /// Squash rewards with `tanh`
    pub clip_rewards: bool,
    pub action_repeat: usize,
    /// Side of square image observations
    pub screen_size: usize,
    pub max_episode_steps: Option<usize>,
    /// Rebuild a failing environment at most this many times
    pub max_restarts: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            id: "point_mass".to_string(),
            num_envs: 4,
            clip_rewards: false,
            action_repeat: 1,
            screen_size: 64,
            max_episode_steps: None,
            max_restarts: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Total steps across all lanes
    pub size: usize,
    /// Accepted for compatibility; storage is always in memory
    pub memmap: bool,
    /// Store the buffer in the player's checkpoint
    pub checkpoint: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 1_000_000,
            memmap: false,
            checkpoint: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// Policy steps between checkpoints; 0 disables periodic saves
    pub every: u64,
    /// Any rank's `ckpt_<step>_<rank>.ckpt` of the run to resume
    pub resume_from: Option<PathBuf>,
    pub save_last: bool,
    pub keep_last: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            every: 100_000,
            resume_from: None,
            save_last: true,
            keep_last: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    /// 0 disables metric aggregation and logging
    pub log_level: u8,
    /// Policy steps between metric flushes
    pub log_every: u64,
    pub disable_timer: bool,
    /// Also write `metrics.jsonl` in the run directory
    pub jsonl: bool,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            log_level: 1,
            log_every: 5_000,
            disable_timer: false,
            jsonl: true,
        }
    }
}

/// Which observation keys go to the encoder and which the decoder
/// reconstructs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySet {
    pub encoder: Vec<String>,
    pub decoder: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgoConfig {
    pub total_steps: u64,
    /// Policy steps of random interaction before training
    pub learning_starts: u64,
    /// Policy steps between training rounds
    pub train_every: u64,
    /// Imagination horizon
    pub horizon: usize,
    pub per_rank_batch_size: usize,
    pub per_rank_sequence_length: usize,
    pub per_rank_gradient_steps: usize,
    /// Gradient steps of the first training round
    pub per_rank_pretrain_steps: usize,
    pub gamma: f64,
    pub lmbda: f64,
    /// Model family, resolved through the model registry
    pub architecture: String,
    pub dense_units: usize,
    pub mlp_layers: usize,
    pub cnn_multiplier: usize,
    pub cnn_keys: KeySet,
    pub mlp_keys: KeySet,
    pub world_model: WorldModelConfig,
    pub actor: ActorConfig,
    pub critic: CriticConfig,
}

impl Default for AlgoConfig {
    fn default() -> Self {
        Self {
            total_steps: 5_000_000,
            learning_starts: 1024,
            train_every: 16,
            horizon: 15,
            per_rank_batch_size: 16,
            per_rank_sequence_length: 64,
            per_rank_gradient_steps: 1,
            per_rank_pretrain_steps: 1,
            gamma: 0.996_094, // 1 - 1/256
            lmbda: 0.95,
            architecture: "standard".to_string(),
            dense_units: 512,
            mlp_layers: 2,
            cnn_multiplier: 32,
            cnn_keys: KeySet::default(),
            mlp_keys: KeySet {
                encoder: vec!["state".to_string()],
                decoder: vec!["state".to_string()],
            },
            world_model: WorldModelConfig::default(),
            actor: ActorConfig::default(),
            critic: CriticConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldModelConfig {
    /// Number of categorical variables
    pub stochastic_size: usize,
    /// Classes per categorical variable
    pub discrete_size: usize,
    pub recurrent_state_size: usize,
    /// Uniform mix applied to categorical probabilities
    pub unimix: f64,
    pub kl_dynamic: f64,
    pub kl_representation: f64,
    pub kl_free_nats: f64,
    pub kl_regularizer: f64,
    pub continue_scale_factor: f64,
    /// Global-norm clip; `None` or non-positive disables clipping
    pub clip_gradients: Option<f64>,
    pub lr: f64,
    pub eps: f64,
}

impl Default for WorldModelConfig {
    fn default() -> Self {
        Self {
            stochastic_size: 32,
            discrete_size: 32,
            recurrent_state_size: 512,
            unimix: 0.01,
            kl_dynamic: 0.5,
            kl_representation: 0.1,
            kl_free_nats: 1.0,
            kl_regularizer: 1.0,
            continue_scale_factor: 1.0,
            clip_gradients: Some(1000.0),
            lr: env_or("DREAMRL_WORLD_LR", 1e-4),
            eps: 1e-8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentileConfig {
    pub low: f64,
    pub high: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentsConfig {
    pub decay: f64,
    /// Lower bound on the return scale
    pub max: f64,
    pub percentile: PercentileConfig,
}

impl Default for PercentileConfig {
    fn default() -> Self {
        Self {
            low: 0.05,
            high: 0.95,
        }
    }
}

impl Default for MomentsConfig {
    fn default() -> Self {
        Self {
            decay: 0.99,
            max: 1.0,
            percentile: PercentileConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    pub expl_amount: f64,
    pub expl_min: f64,
    pub expl_decay: bool,
    /// Gradient steps over which exploration decays to `expl_min`
    pub max_step_expl_decay: u64,
    pub ent_coef: f64,
    pub moments: MomentsConfig,
    pub clip_gradients: Option<f64>,
    pub lr: f64,
    pub eps: f64,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            expl_amount: 0.0,
            expl_min: 0.0,
            expl_decay: false,
            max_step_expl_decay: 0,
            ent_coef: 3e-4,
            moments: MomentsConfig::default(),
            clip_gradients: Some(100.0),
            lr: env_or("DREAMRL_ACTOR_LR", 8e-5),
            eps: 1e-5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    /// Polyak factor after the first hard copy
    pub tau: f64,
    /// Gradient steps between target syncs
    pub target_network_update_freq: u64,
    pub clip_gradients: Option<f64>,
    pub lr: f64,
    pub eps: f64,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            tau: 0.02,
            target_network_update_freq: 1,
            clip_gradients: Some(100.0),
            lr: env_or("DREAMRL_CRITIC_LR", 8e-5),
            eps: 1e-5,
        }
    }
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.with_env_overrides())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Environment variables win over values read from a file.
    pub fn with_env_overrides(mut self) -> Self {
        let wm = &mut self.algo.world_model;
        wm.lr = env_or("DREAMRL_WORLD_LR", wm.lr);
        self.algo.actor.lr = env_or("DREAMRL_ACTOR_LR", self.algo.actor.lr);
        self.algo.critic.lr = env_or("DREAMRL_CRITIC_LR", self.algo.critic.lr);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.distributed.world_size = world_size;
        self
    }

    pub fn with_env(mut self, id: &str, num_envs: usize) -> Self {
        self.env.id = id.to_string();
        self.env.num_envs = num_envs;
        self
    }

    pub fn with_total_steps(mut self, total_steps: u64) -> Self {
        self.algo.total_steps = total_steps;
        self
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    pub fn with_resume_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint.resume_from = Some(path.into());
        self
    }

    /// Shrink the model and batch sizes for smoke runs.
    pub fn tiny(mut self) -> Self {
        let algo = &mut self.algo;
        algo.dense_units = 32;
        algo.mlp_layers = 1;
        algo.cnn_multiplier = 4;
        algo.horizon = 3;
        algo.per_rank_batch_size = 2;
        algo.per_rank_sequence_length = 4;
        algo.world_model.stochastic_size = 4;
        algo.world_model.discrete_size = 4;
        algo.world_model.recurrent_state_size = 16;
        self
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root_dir.join(&self.run_name)
    }

    pub fn learners(&self) -> usize {
        self.distributed.world_size.saturating_sub(1)
    }

    /// Environment steps per player iteration.
    pub fn policy_steps_per_update(&self) -> u64 {
        self.env.num_envs as u64
    }

    /// Steps kept per lane.
    pub fn buffer_capacity_per_lane(&self) -> usize {
        self.buffer.size / self.env.num_envs.max(1)
    }

    /// Encoder keys, image keys first.
    pub fn encoder_keys(&self) -> Vec<String> {
        let mut keys = self.algo.cnn_keys.encoder.clone();
        keys.extend(self.algo.mlp_keys.encoder.iter().cloned());
        keys
    }

    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(DreamError::Configuration(msg));

        if self.distributed.world_size < 2 {
            return err(format!(
                "world_size must be at least 2 (one player, one learner), got {}",
                self.distributed.world_size
            ));
        }
        if self.env.num_envs == 0 || self.env.action_repeat == 0 {
            return err("env.num_envs and env.action_repeat must be positive".into());
        }
        let algo = &self.algo;
        if algo.per_rank_batch_size == 0 || algo.per_rank_sequence_length == 0 {
            return err("per_rank_batch_size and per_rank_sequence_length must be positive".into());
        }
        if algo.per_rank_gradient_steps == 0 {
            return err("per_rank_gradient_steps must be positive".into());
        }
        if algo.horizon == 0 {
            return err("algo.horizon must be at least 1".into());
        }
        if self.buffer_capacity_per_lane() < algo.per_rank_sequence_length {
            return err(format!(
                "buffer.size {} leaves {} steps per lane, fewer than the sequence length {}",
                self.buffer.size,
                self.buffer_capacity_per_lane(),
                algo.per_rank_sequence_length
            ));
        }

        let cnn_enc: BTreeSet<&String> = algo.cnn_keys.encoder.iter().collect();
        let mlp_enc: BTreeSet<&String> = algo.mlp_keys.encoder.iter().collect();
        if cnn_enc.is_empty() && mlp_enc.is_empty() {
            return err("at least one encoder key is required".into());
        }
        if let Some(k) = cnn_enc.intersection(&mlp_enc).next() {
            return err(format!("key '{k}' is both a cnn and an mlp encoder key"));
        }
        for (kind, keys, enc) in [
            ("cnn", &algo.cnn_keys.decoder, &cnn_enc),
            ("mlp", &algo.mlp_keys.decoder, &mlp_enc),
        ] {
            if let Some(k) = keys.iter().find(|k| !enc.contains(k)) {
                return err(format!("{kind} decoder key '{k}' is not a {kind} encoder key"));
            }
        }
        if !cnn_enc.is_empty() {
            let s = self.env.screen_size;
            if s < 16 || !s.is_power_of_two() {
                return err(format!("screen_size must be a power of two >= 16, got {s}"));
            }
        }

        let wm = &algo.world_model;
        if wm.stochastic_size == 0 || wm.discrete_size == 0 || wm.recurrent_state_size == 0 {
            return err("world model sizes must be positive".into());
        }
        if !(0.0..1.0).contains(&wm.unimix) {
            return err(format!("unimix must be in [0, 1), got {}", wm.unimix));
        }
        if !(0.0..=1.0).contains(&algo.critic.tau) {
            return err(format!("critic.tau must be in [0, 1], got {}", algo.critic.tau));
        }
        if algo.critic.target_network_update_freq == 0 {
            return err("target_network_update_freq must be positive".into());
        }

        let per_update = self.policy_steps_per_update();
        if self.metric.log_level > 0 && self.metric.log_every % per_update != 0 {
            tracing::warn!(
                log_every = self.metric.log_every,
                per_update,
                "metric.log_every is not a multiple of the policy steps per update, logs will be approximate"
            );
        }
        if self.checkpoint.every % per_update != 0 {
            tracing::warn!(
                every = self.checkpoint.every,
                per_update,
                "checkpoint.every is not a multiple of the policy steps per update"
            );
        }
        if self.buffer.memmap {
            tracing::warn!("buffer.memmap is not supported, the buffer stays in memory");
        }
        Ok(())
    }
}
