//! # dreamrl
//!
//! World-model reinforcement learning in Rust.
//!
//! ## Overview
//!
//! dreamrl provides:
//! - A per-lane sequential replay buffer with contiguous window sampling
//! - A recurrent state-space model (RSSM) with posterior and imagination steps
//!   - requires `torch` feature
//! - A Dreamer-style training step (world model, imagination, actor-critic)
//!   - requires `torch` feature
//! - A decoupled player/learner coordinator built on explicit collective handles
//! - Per-rank checkpointing with exact counter resume
//!
//! ## Features
//!
//! - `default` - Buffer, coordinator, collectives, checkpoints (no libtorch)
//! - `torch` - World model, trainer and player agents (requires libtorch)
//! - `tensorboard` - TensorBoard metric sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dreamrl::prelude::*;
//!
//! let config = RunConfig::from_json_file("run.json")?;
//! config.validate()?;
//!
//! let registry = BackendRegistry::with_defaults();
//! let groups = registry.launch(&config.distributed)?;
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod log;
pub mod metrics;
pub mod spaces;
pub mod utils;
pub mod vector;

#[cfg(feature = "torch")]
pub mod dreamer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{EnvIndependentReplayBuffer, LaneBuffer, SequenceBatch, StepData};
    pub use crate::checkpoint::{CheckpointManager, CheckpointRecord, Checkpointable, Counters};
    pub use crate::comm::{BackendRegistry, CommunicationGroup, Payload};
    pub use crate::config::RunConfig;
    pub use crate::coordinator::{Learner, LearnerAgent, Player, PlayerAgent};
    pub use crate::env::{DreamEnv, EnvInfo, ObsDict, StepResult};
    pub use crate::log::{CompositeLogger, ConsoleLogger, JsonlLogger, MetricLogger, NoOpLogger};
    pub use crate::metrics::{MetricsContext, Timers};
    pub use crate::spaces::DynSpace;
    pub use crate::vector::{Serial, VecEnvBackend};

    #[cfg(feature = "torch")]
    pub use crate::dreamer::{DreamerLearner, DreamerPlayer, DreamerTrainer, ModelRegistry, Rssm};

    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum DreamError {
    #[error("Insufficient data in lane {lane}: {available} valid steps, {requested} requested")]
    InsufficientData {
        lane: usize,
        available: usize,
        requested: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Non-finite gradient norm: {norm}")]
    NonFiniteGradient { norm: f64 },

    #[error("Shape mismatch for '{key}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Environment error: {0}")]
    Env(String),

    #[error("Collective error: {0}")]
    Collective(#[from] comm::CollectiveError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "torch")]
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

impl From<bincode::Error> for DreamError {
    fn from(e: bincode::Error) -> Self {
        DreamError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DreamError {
    fn from(e: serde_json::Error) -> Self {
        DreamError::Serialization(e.to_string())
    }
}

pub type Result<T> = core::result::Result<T, DreamError>;
