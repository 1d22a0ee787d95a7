//! Environment contract and wrappers.
//!
//! Environments emit dictionary observations (`ObsDict`). Keys are later
//! partitioned into encoder keys (image / vector) and passthrough keys by
//! the run configuration.

mod traits;
mod wrappers;

pub use traits::{DreamEnv, EnvInfo, ObsDict, StepResult};
pub use wrappers::{ActionRepeat, ClipAction, EpisodeStats, RestartOnError};
