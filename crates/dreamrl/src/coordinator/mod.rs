//! Decoupled player/learner training loop.
//!
//! Rank 0 (the [`Player`]) steps the environments, fills the replay buffer
//! and scatters sequence batches; ranks `1..world_size` ([`Learner`]s) train
//! on their chunk and rank 1 publishes the player parameters back.
//!
//! One round of the protocol, in the order every rank issues it:
//!
//! 1. world `scatter` from the player: a [`TrainRequest`] per learner
//! 2. learners train, all-reducing gradients in the optimization group
//! 3. if metrics were requested: optimization-group `gather` to rank 1
//! 4. pair `{0, 1}` `broadcast` of the parameters from rank 1
//! 5. if metrics were requested: pair `broadcast` of the metrics from rank 1
//! 6. every rank writes its checkpoint if the request says so
//!
//! Startup is a world `broadcast` of the [`RunSetup`] followed by a pair
//! `broadcast` of the initial parameters. Shutdown is a world `scatter` of
//! the sentinel after which no rank issues another collective.
//!
//! [`TrainRequest`]: crate::comm::TrainRequest
//! [`RunSetup`]: crate::comm::RunSetup

mod launch;
mod learner;
mod player;
mod schedule;

pub use launch::{launch_local, RunSummary};
pub use learner::{Learner, LearnerPhase, LearnerSummary};
pub use player::{Player, PlayerPhase, PlayerSummary};
pub use schedule::{polynomial_decay, ExplorationSchedule, TargetSync};

use crate::buffer::SequenceBatch;
use crate::checkpoint::Checkpointable;
use crate::comm::CommunicationGroup;
use crate::env::ObsDict;
use crate::metrics::MetricsContext;
use crate::Result;
use ndarray::ArrayD;

/// Acting side of an agent, owned by the player.
pub trait PlayerAgent: Send {
    /// Encoded actions `[N, encoded_dim]` for a batch of observations.
    ///
    /// `exploration` is the current exploration amount; agents add their own
    /// noise from it.
    fn act(&mut self, observations: &ObsDict, exploration: f64) -> Result<ArrayD<f32>>;

    /// Clear the recurrent state of lanes that started a new episode.
    fn reset_lanes(&mut self, lanes: &[usize]) -> Result<()>;

    /// Install parameters published by the lead learner.
    fn load_parameters(&mut self, values: &[f32]) -> Result<()>;
}

/// Training side of an agent, one per learner rank.
pub trait LearnerAgent: Checkpointable + Send {
    /// One gradient step on one sequence batch.
    fn train(&mut self, batch: &SequenceBatch, ctx: &mut TrainContext<'_>) -> Result<()>;

    /// Blend the target critic toward the critic: `target = tau * source + (1 - tau) * target`.
    fn sync_target(&mut self, tau: f64) -> Result<()>;

    /// Flattened parameters the player needs to act.
    fn player_parameters(&self) -> Result<Vec<f32>>;
}

/// What a learner hands its agent for one gradient step.
pub struct TrainContext<'a> {
    /// Learner-only group used to average gradients
    pub group: &'a dyn CommunicationGroup,
    pub metrics: &'a mut MetricsContext,
    /// Gradient steps this rank completed before this one
    pub gradient_step: u64,
}
