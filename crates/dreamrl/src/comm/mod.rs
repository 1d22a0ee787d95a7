//! Collective communication between ranks.
//!
//! Every rank holds explicit [`CommunicationGroup`] handles; there is no
//! process-wide "current rank". Three groups are used by the coordinator:
//! the world group, the player/trainer pair `{0, 1}` and the optimization
//! group `{1..world_size}`.
//!
//! All collectives are blocking rendezvous. Every member of a group must
//! issue the same collectives in the same order.

mod local;
mod registry;

pub use local::{LocalGroup, LocalHub};
pub use registry::{BackendFactory, BackendRegistry};

use crate::buffer::SequenceBatch;
use crate::checkpoint::Counters;
use crate::config::RunConfig;
use crate::log::Metrics;
use crate::spaces::{Dict, DynSpace};
use serde::{Deserialize, Serialize};

/// Rank of the player in the world group.
pub const PLAYER_RANK: usize = 0;
/// Rank of the learner that publishes parameters and metrics.
pub const LEAD_LEARNER_RANK: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("{op} timed out after {secs}s waiting for rank {src}")]
    Timeout {
        op: &'static str,
        src: usize,
        secs: u64,
    },

    #[error("{op}: peer disconnected")]
    Disconnected { op: &'static str },

    #[error("expected {expected} entries, got {actual}")]
    RankMismatch { expected: usize, actual: usize },

    #[error("expected a {expected} payload, got {actual}")]
    UnexpectedPayload {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("rank {rank} is not a member of the group")]
    NotAMember { rank: usize },

    #[error("rank {rank} aborted the run: {reason}")]
    Aborted { rank: usize, reason: String },
}

pub type CommResult<T> = std::result::Result<T, CollectiveError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Registered backend name, `"local"` runs one thread per rank
    pub backend: String,
    /// Player plus learners; at least 2
    pub world_size: usize,
    /// Receive timeout for every collective
    pub timeout_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            world_size: 2,
            timeout_secs: 86_400,
        }
    }
}

/// What the player tells learners at startup.
#[derive(Clone, Debug)]
pub struct RunSetup {
    pub config: RunConfig,
    pub observation_space: Dict,
    pub action_space: DynSpace,
}

/// One training round for one learner.
///
/// The player decides logging and checkpoint cadence; learners only follow
/// these flags so that every rank enters the same collectives.
#[derive(Clone, Debug, Default)]
pub struct TrainRequest {
    /// One sequence batch per gradient step
    pub batches: Vec<SequenceBatch>,
    pub policy_step: u64,
    /// Player counters after this round, written verbatim into checkpoints
    pub counters: Counters,
    /// Lead learner must broadcast aggregated metrics after publishing params
    pub send_metrics: bool,
    /// Every rank writes its checkpoint after this round
    pub checkpoint: bool,
}

#[derive(Clone, Debug)]
pub enum Payload {
    Setup(Box<RunSetup>),
    Train(Box<TrainRequest>),
    /// Shutdown sentinel: write the final checkpoint and return
    Shutdown { policy_step: u64, counters: Counters },
    /// The player failed outside a round; learners exit without checkpointing
    Abort { reason: String },
    /// Flattened player parameters
    Params(Vec<f32>),
    Metrics(Metrics),
    Tensor(Vec<f32>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Setup(_) => "setup",
            Payload::Train(_) => "train",
            Payload::Shutdown { .. } => "shutdown",
            Payload::Abort { .. } => "abort",
            Payload::Params(_) => "params",
            Payload::Metrics(_) => "metrics",
            Payload::Tensor(_) => "tensor",
        }
    }

    pub fn into_tensor(self) -> CommResult<Vec<f32>> {
        match self {
            Payload::Tensor(values) => Ok(values),
            other => Err(CollectiveError::UnexpectedPayload {
                expected: "tensor",
                actual: other.kind(),
            }),
        }
    }

    pub fn into_metrics(self) -> CommResult<Metrics> {
        match self {
            Payload::Metrics(m) => Ok(m),
            other => Err(CollectiveError::UnexpectedPayload {
                expected: "metrics",
                actual: other.kind(),
            }),
        }
    }

    pub fn into_setup(self) -> CommResult<RunSetup> {
        match self {
            Payload::Setup(s) => Ok(*s),
            other => Err(CollectiveError::UnexpectedPayload {
                expected: "setup",
                actual: other.kind(),
            }),
        }
    }

    pub fn into_params(self) -> CommResult<Vec<f32>> {
        match self {
            Payload::Params(values) => Ok(values),
            other => Err(CollectiveError::UnexpectedPayload {
                expected: "params",
                actual: other.kind(),
            }),
        }
    }
}

/// Handle on a set of ranks. Ranks passed to and returned by the methods
/// are group-local, except for `create_subgroup` which takes world ranks.
pub trait CommunicationGroup: Send {
    /// Rank inside this group.
    fn rank(&self) -> usize;

    /// Rank inside the world group.
    fn global_rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// `src` sends `payload` to every member; everyone returns it.
    fn broadcast(&self, payload: Option<Payload>, src: usize) -> CommResult<Payload>;

    /// `src` provides one payload per member; member `i` returns entry `i`.
    fn scatter(&self, payloads: Option<Vec<Payload>>, src: usize) -> CommResult<Payload>;

    /// Every member sends to `dst`; only `dst` gets `Some`, in rank order.
    fn gather(&self, payload: Payload, dst: usize) -> CommResult<Option<Vec<Payload>>>;

    /// Elementwise mean across members, written back in place.
    fn all_reduce_mean(&self, values: &mut [f32]) -> CommResult<()>;

    fn barrier(&self) -> CommResult<()> {
        self.all_reduce_mean(&mut [])
    }

    /// Group over the listed world ranks. The caller must be one of them.
    fn create_subgroup(&self, world_ranks: &[usize]) -> CommResult<Box<dyn CommunicationGroup>>;
}
