//! Turning a loaded record back into loop counters.

use super::{CheckpointRecord, Counters};
use crate::buffer::EnvIndependentReplayBuffer;
use crate::{DreamError, Result};

/// Where a run (re)starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    /// First player iteration to run (1-based)
    pub start_update: u64,
    /// Environment steps already taken across all lanes
    pub policy_step: u64,
    pub last_log: u64,
    pub last_checkpoint: u64,
    pub per_rank_batch_size: usize,
    /// Iteration at which training starts, shifted by the resumed updates
    pub learning_starts: u64,
}

impl ResumePoint {
    /// Fresh run.
    pub fn fresh(per_rank_batch_size: usize, learning_starts: u64) -> Self {
        Self {
            start_update: 1,
            policy_step: 0,
            last_log: 0,
            last_checkpoint: 0,
            per_rank_batch_size,
            learning_starts,
        }
    }

    /// Restore from a checkpointed run with `learners` learner ranks and
    /// `num_envs` lanes per iteration.
    pub fn from_counters(
        counters: &Counters,
        learners: usize,
        num_envs: usize,
        learning_starts: u64,
    ) -> Result<Self> {
        if learners == 0 {
            return Err(DreamError::Configuration("no learner ranks".into()));
        }
        // Lanes may differ from the checkpointed run, so the marks can sit
        // past the recomputed step.
        let policy_step = counters.update * num_envs as u64;
        Ok(Self {
            start_update: counters.update + 1,
            policy_step,
            last_log: counters.last_log.min(policy_step),
            last_checkpoint: counters.last_checkpoint.min(policy_step),
            per_rank_batch_size: counters.batch_size / learners,
            learning_starts: learning_starts + counters.update,
        })
    }

    /// Counters to persist after completing `update`.
    pub fn counters(&self, update: u64, learners: usize) -> Counters {
        Counters {
            update,
            last_log: self.last_log,
            last_checkpoint: self.last_checkpoint,
            batch_size: self.per_rank_batch_size * learners,
        }
    }

    /// Decode the buffer stored in a player record.
    ///
    /// A buffer written under a different world size or lane count cannot
    /// be reused.
    pub fn restore_buffer(
        record: &CheckpointRecord,
        world_size: usize,
        num_envs: usize,
    ) -> Result<Option<EnvIndependentReplayBuffer>> {
        let Some(bytes) = record.buffer_state.as_deref() else {
            return Ok(None);
        };
        if record.world_size != world_size {
            return Err(DreamError::Configuration(format!(
                "checkpointed buffer was written with world size {}, current world size is {}",
                record.world_size, world_size
            )));
        }
        let buffer: EnvIndependentReplayBuffer = bincode::deserialize(bytes)?;
        if buffer.num_lanes() != num_envs {
            return Err(DreamError::Configuration(format!(
                "checkpointed buffer has {} lanes, env.num_envs is {}",
                buffer.num_lanes(),
                num_envs
            )));
        }
        Ok(Some(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_roundtrip_exactly() {
        let counters = Counters {
            update: 250,
            last_log: 960,
            last_checkpoint: 800,
            batch_size: 48,
        };
        let resume = ResumePoint::from_counters(&counters, 3, 4, 100).unwrap();
        assert_eq!(resume.start_update, 251);
        assert_eq!(resume.policy_step, 1000);
        assert_eq!(resume.per_rank_batch_size, 16);
        assert_eq!(resume.learning_starts, 350);
        assert_eq!(resume.counters(250, 3), counters);
    }

    #[test]
    fn test_fewer_lanes_keep_marks_behind_policy_step() {
        let counters = Counters {
            update: 8,
            last_log: 32,
            last_checkpoint: 32,
            batch_size: 4,
        };
        let resume = ResumePoint::from_counters(&counters, 2, 2, 0).unwrap();
        assert_eq!(resume.policy_step, 16);
        assert_eq!(resume.last_log, 16);
        assert_eq!(resume.last_checkpoint, 16);
    }

    #[test]
    fn test_buffer_world_size_mismatch() {
        let buffer = EnvIndependentReplayBuffer::new(8, 2).unwrap();
        let record = CheckpointRecord::new(0, 0, 3, Counters::default())
            .with_buffer_state(bincode::serialize(&buffer).unwrap());

        assert!(matches!(
            ResumePoint::restore_buffer(&record, 2, 2),
            Err(DreamError::Configuration(_))
        ));
        assert!(ResumePoint::restore_buffer(&record, 3, 5).is_err());
        let restored = ResumePoint::restore_buffer(&record, 3, 2).unwrap().unwrap();
        assert_eq!(restored.num_lanes(), 2);
    }

    #[test]
    fn test_record_without_buffer() {
        let record = CheckpointRecord::new(0, 0, 2, Counters::default());
        assert!(ResumePoint::restore_buffer(&record, 7, 1).unwrap().is_none());
    }
}
