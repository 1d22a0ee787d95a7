//! Run a player and its learners as threads of the current process.

use super::{Learner, LearnerAgent, LearnerSummary, Player, PlayerAgent, PlayerSummary};
use crate::checkpoint::CheckpointConfig;
use crate::comm::{BackendRegistry, RunSetup};
use crate::config::RunConfig;
use crate::log::MetricLogger;
use crate::vector::VecEnvBackend;
use crate::{DreamError, Result};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub player: PlayerSummary,
    /// Ordered by rank
    pub learners: Vec<LearnerSummary>,
}

pub(crate) fn checkpoint_config(config: &RunConfig) -> CheckpointConfig {
    CheckpointConfig::new(config.run_dir())
        .every(config.checkpoint.every)
        .keep_last(config.checkpoint.keep_last)
        .save_last(config.checkpoint.save_last)
        .save_buffer(config.buffer.checkpoint)
}

/// Launch `config.distributed.world_size` ranks: the player runs on the
/// calling thread, each learner on its own thread building its agent with
/// `build_learner`.
///
/// ```ignore
/// let summary = launch_local(&registry, config, envs, player_agent, logger, |setup, rank| {
///     DreamerLearner::new(setup, rank)
/// })?;
/// ```
pub fn launch_local<V, P, L, F>(
    registry: &BackendRegistry,
    config: RunConfig,
    envs: V,
    player_agent: P,
    logger: Box<dyn MetricLogger>,
    build_learner: F,
) -> Result<RunSummary>
where
    V: VecEnvBackend,
    P: PlayerAgent,
    L: LearnerAgent + 'static,
    F: Fn(&RunSetup, usize) -> Result<L> + Send + Sync + 'static,
{
    config.validate()?;
    let mut groups = registry.launch(&config.distributed)?.into_iter();
    let world = groups
        .next()
        .ok_or_else(|| DreamError::Configuration("backend returned no ranks".into()))?;
    // Built before any learner is waiting on the setup broadcast
    let player = Player::new(config, envs, player_agent, world, logger)?;

    let build_learner = Arc::new(build_learner);
    let handles = groups
        .enumerate()
        .map(|(i, group)| {
            let build = Arc::clone(&build_learner);
            thread::Builder::new()
                .name(format!("learner-{}", i + 1))
                .spawn(move || Learner::connect(group, |setup, rank| build(setup, rank))?.run())
                .map_err(DreamError::Io)
        })
        .collect::<Result<Vec<_>>>()?;
    info!(learners = handles.len(), "Spawned learner threads");

    let player = player.run();

    let mut learners = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(summary)) => learners.push(summary),
            Ok(Err(e)) => {
                error!(rank = i + 1, "Learner failed: {}", e);
                first_error.get_or_insert(e);
            }
            Err(_) => {
                first_error.get_or_insert(DreamError::Configuration(format!(
                    "learner thread {} panicked",
                    i + 1
                )));
            }
        }
    }

    // The player's error explains the learners' aborts, report it first
    let player = player?;
    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(RunSummary { player, learners })
}
