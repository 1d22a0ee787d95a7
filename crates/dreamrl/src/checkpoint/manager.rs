//! Checkpoint manager: per-rank file naming, cadence and rotation.

use super::state::CheckpointRecord;
use crate::{DreamError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Run directory; files go to `<dir>/checkpoint/`
    pub dir: PathBuf,
    /// Save when `policy_step - last_checkpoint >= every` (0 disables)
    pub every: u64,
    /// Keep only the last N checkpoints of this rank (0 = keep all)
    pub keep_last: usize,
    /// Write a final checkpoint on shutdown
    pub save_last: bool,
    /// Include the replay buffer in the player's checkpoint
    pub save_buffer: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("runs"),
            every: 0,
            keep_last: 5,
            save_last: true,
            save_buffer: false,
        }
    }
}

impl CheckpointConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn every(mut self, policy_steps: u64) -> Self {
        self.every = policy_steps;
        self
    }

    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }

    pub fn save_last(mut self, enabled: bool) -> Self {
        self.save_last = enabled;
        self
    }

    pub fn save_buffer(mut self, enabled: bool) -> Self {
        self.save_buffer = enabled;
        self
    }
}

/// Manages the checkpoint files of one rank.
///
/// ```ignore
/// let manager = CheckpointManager::new(CheckpointConfig::new("runs/exp").every(10_000), rank);
/// if manager.is_due(policy_step, counters.last_checkpoint) {
///     manager.save(&record)?;
/// }
/// ```
pub struct CheckpointManager {
    config: CheckpointConfig,
    rank: usize,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig, rank: usize) -> Self {
        Self { config, rank }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config.dir.join("checkpoint")
    }

    /// `<dir>/checkpoint/ckpt_{policy_step}_{rank}.ckpt`
    pub fn path_for(&self, policy_step: u64) -> PathBuf {
        self.checkpoint_dir()
            .join(format!("ckpt_{}_{}.ckpt", policy_step, self.rank))
    }

    /// Cadence check made by the player once per iteration.
    pub fn is_due(&self, policy_step: u64, last_checkpoint: u64) -> bool {
        self.config.every > 0 && policy_step.saturating_sub(last_checkpoint) >= self.config.every
    }

    /// Write `record` to its per-rank path, then rotate old files.
    pub fn save(&self, record: &CheckpointRecord) -> Result<PathBuf> {
        if record.rank != self.rank {
            return Err(DreamError::Configuration(format!(
                "rank {} cannot write a checkpoint for rank {}",
                self.rank, record.rank
            )));
        }
        fs::create_dir_all(self.checkpoint_dir())?;
        let path = self.path_for(record.policy_step);

        // Write-then-rename so a crash never leaves a truncated checkpoint
        let tmp = path.with_extension("ckpt.tmp");
        fs::write(&tmp, record.to_bytes()?)?;
        fs::rename(&tmp, &path)?;
        tracing::info!(path = %path.display(), policy_step = record.policy_step, rank = self.rank, "Saved checkpoint");

        if self.config.keep_last > 0 {
            self.cleanup_old_checkpoints()?;
        }
        Ok(path)
    }

    /// Load a checkpoint file, checking it belongs to this rank.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<CheckpointRecord> {
        let record = CheckpointRecord::from_bytes(&fs::read(path.as_ref())?)?;
        if record.rank != self.rank {
            return Err(DreamError::Configuration(format!(
                "checkpoint {} belongs to rank {}, not {}",
                path.as_ref().display(),
                record.rank,
                self.rank
            )));
        }
        tracing::info!(path = %path.as_ref().display(), policy_step = record.policy_step, "Loaded checkpoint");
        Ok(record)
    }

    /// Given any rank's checkpoint path, load the sibling for this rank.
    pub fn load_resume(&self, resume_from: impl AsRef<Path>) -> Result<CheckpointRecord> {
        let path = Self::rank_path(resume_from.as_ref(), self.rank)?;
        self.load(path)
    }

    /// This rank's checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(self.checkpoint_dir()) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };
        let mut checkpoints: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| match Self::parse_name(&p) {
                Some((step, rank)) if rank == self.rank => Some((step, p)),
                _ => None,
            })
            .collect();
        checkpoints.sort();
        Ok(checkpoints.into_iter().map(|(_, p)| p).collect())
    }

    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop())
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list_checkpoints()?;
        while checkpoints.len() > self.config.keep_last {
            let old = checkpoints.remove(0);
            if let Err(e) = fs::remove_file(&old) {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old checkpoint");
            }
        }
        Ok(())
    }

    /// `(policy_step, rank)` from a `ckpt_{step}_{rank}.ckpt` file name.
    pub fn parse_name(path: &Path) -> Option<(u64, usize)> {
        let stem = path
            .file_name()?
            .to_str()?
            .strip_prefix("ckpt_")?
            .strip_suffix(".ckpt")?;
        let (step, rank) = stem.rsplit_once('_')?;
        Some((step.parse().ok()?, rank.parse().ok()?))
    }

    /// Same checkpoint, other rank.
    pub fn rank_path(path: &Path, rank: usize) -> Result<PathBuf> {
        let (step, _) = Self::parse_name(path).ok_or_else(|| {
            DreamError::Configuration(format!(
                "'{}' is not a ckpt_<step>_<rank>.ckpt file",
                path.display()
            ))
        })?;
        Ok(path.with_file_name(format!("ckpt_{step}_{rank}.ckpt")))
    }
}
