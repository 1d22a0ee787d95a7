//! Checkpoint records and trait definitions.

use crate::Result;
use serde::{Deserialize, Serialize};

/// Trait for components that can be checkpointed.
///
/// ```ignore
/// impl Checkpointable for MyAgent {
///     fn save_state(&self) -> Result<Vec<u8>> {
///         Ok(bincode::serialize(&self.state)?)
///     }
///
///     fn load_state(&mut self, data: &[u8]) -> Result<()> {
///         self.state = bincode::deserialize(data)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Checkpointable {
    fn save_state(&self) -> Result<Vec<u8>>;

    fn load_state(&mut self, data: &[u8]) -> Result<()>;
}

/// Loop counters restored verbatim on resume.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Completed player iterations
    pub update: u64,
    /// Policy step of the last metric flush
    pub last_log: u64,
    /// Policy step of the last checkpoint
    pub last_checkpoint: u64,
    /// Global batch size (per-rank size times learners)
    pub batch_size: usize,
}

/// Everything one rank writes to `ckpt_{policy_step}_{rank}.ckpt`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CheckpointRecord {
    pub policy_step: u64,
    pub rank: usize,
    pub world_size: usize,
    pub counters: Counters,
    /// Agent weights, optimizer moments, moments tracker, exploration state
    pub agent_state: Option<Vec<u8>>,
    /// Replay buffer (player only, when enabled)
    pub buffer_state: Option<Vec<u8>>,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub version: String,
}

impl CheckpointRecord {
    pub fn new(policy_step: u64, rank: usize, world_size: usize, counters: Counters) -> Self {
        Self {
            policy_step,
            rank,
            world_size,
            counters,
            agent_state: None,
            buffer_state: None,
            timestamp: unix_timestamp(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn with_agent_state(mut self, state: Vec<u8>) -> Self {
        self.agent_state = Some(state);
        self
    }

    pub fn with_buffer_state(mut self, state: Vec<u8>) -> Self {
        self.buffer_state = Some(state);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

fn unix_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let counters = Counters {
            update: 12,
            last_log: 40,
            last_checkpoint: 48,
            batch_size: 32,
        };
        let record = CheckpointRecord::new(48, 1, 3, counters).with_agent_state(vec![4, 5, 6]);

        assert_eq!(record.counters, counters);
        assert_eq!(record.agent_state, Some(vec![4, 5, 6]));
        assert!(record.buffer_state.is_none());
        assert_eq!(record.version, crate::VERSION);
    }

    #[test]
    fn test_record_bytes_roundtrip() {
        let record = CheckpointRecord::new(8, 0, 2, Counters::default()).with_buffer_state(vec![1]);
        let restored = CheckpointRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.policy_step, 8);
        assert_eq!(restored.buffer_state, Some(vec![1]));
        assert!(CheckpointRecord::from_bytes(&[1, 2]).is_err());
    }
}
