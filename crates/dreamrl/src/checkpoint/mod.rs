//! Per-rank checkpointing and exact counter resume.
//!
//! - `Checkpointable` for components that serialize their own state
//! - `CheckpointRecord` is what one rank writes: counters, agent state and,
//!   on the player, optionally the replay buffer
//! - `CheckpointManager` owns file naming, cadence and rotation
//! - `ResumePoint` turns a loaded record back into loop counters

mod manager;
mod resume;
mod state;

pub use manager::{CheckpointConfig, CheckpointManager};
pub use resume::ResumePoint;
pub use state::{CheckpointRecord, Checkpointable, Counters};
