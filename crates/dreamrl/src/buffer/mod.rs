//! Sequential replay storage.
//!
//! Every environment lane owns an independent ring ([`LaneBuffer`]); the
//! [`EnvIndependentReplayBuffer`] samples contiguous windows from randomly
//! chosen lanes and assembles them into time-major [`SequenceBatch`]es.
//!
//! Once a step is inserted it is never modified, with one exception:
//! [`EnvIndependentReplayBuffer::mark_restart_boundary`] closes the last
//! written step of a lane whose environment had to be rebuilt.

mod batch;
mod lane;
mod replay;
mod step;

pub use batch::SequenceBatch;
pub use lane::LaneBuffer;
pub use replay::EnvIndependentReplayBuffer;
pub use step::StepData;

/// Keys every step must carry besides the observation keys.
pub const ACTIONS: &str = "actions";
pub const REWARDS: &str = "rewards";
pub const DONES: &str = "dones";
pub const IS_FIRST: &str = "is_first";

/// Observation keys starting with this prefix are stored but never encoded.
pub const PASSTHROUGH_PREFIX: &str = "mask";
