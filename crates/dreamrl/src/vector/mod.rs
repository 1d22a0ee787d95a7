//! Vectorized environments.
//!
//! The player drives `num_envs` lanes in lockstep. Only a serial backend is
//! provided; episode ends are auto-reset within the same step and the
//! terminal observation is returned separately.

mod serial;
mod vecenv;

pub use serial::Serial;
pub use vecenv::{stack_observations, VecEnvBackend, VecEnvConfig, VecStep};
