//! Ranks `1..world_size`: train on scattered batches, publish parameters.

use super::{LearnerAgent, TargetSync, TrainContext};
use crate::checkpoint::{CheckpointManager, CheckpointRecord, Counters};
use crate::comm::{
    CollectiveError, CommunicationGroup, Payload, RunSetup, TrainRequest, LEAD_LEARNER_RANK,
    PLAYER_RANK,
};
use crate::config::RunConfig;
use crate::log::Metrics;
use crate::metrics::{MetricsContext, Timers};
use crate::{DreamError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

const TRAIN_TIME: &str = "Time/train_time";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LearnerPhase {
    AwaitBatch,
    Train,
    PublishParams,
    Finished,
}

/// Learner-side state persisted next to the agent's own bytes.
#[derive(Serialize, Deserialize)]
struct LearnerState {
    gradient_steps: u64,
    agent: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct LearnerSummary {
    pub rank: usize,
    pub gradient_steps: u64,
    pub rounds: u64,
    pub checkpoints: Vec<PathBuf>,
}

pub struct Learner<A: LearnerAgent> {
    config: RunConfig,
    agent: A,
    world: Box<dyn CommunicationGroup>,
    optimization: Box<dyn CommunicationGroup>,
    /// Pair group `{0, 1}`, only held by the lead learner
    pair: Option<Box<dyn CommunicationGroup>>,
    manager: CheckpointManager,
    target_sync: TargetSync,
    metrics: MetricsContext,
    timers: Timers,
    gradient_steps: u64,
    /// Gradient steps at the last metric flush
    logged_steps: u64,
    phase: LearnerPhase,
}

impl<A: LearnerAgent> Learner<A> {
    /// Receive the run setup from the player, build the agent, restore it
    /// when resuming and publish its initial parameters.
    pub fn connect<F>(world: Box<dyn CommunicationGroup>, build_agent: F) -> Result<Self>
    where
        F: FnOnce(&RunSetup, usize) -> Result<A>,
    {
        let rank = world.global_rank();
        if rank == PLAYER_RANK {
            return Err(DreamError::Configuration(format!(
                "rank {PLAYER_RANK} is reserved for the player"
            )));
        }
        let setup = world.broadcast(None, PLAYER_RANK)?.into_setup()?;
        let config = setup.config.clone();

        let learners: Vec<usize> = (1..world.world_size()).collect();
        let optimization = world.create_subgroup(&learners)?;
        let pair = if rank == LEAD_LEARNER_RANK {
            Some(world.create_subgroup(&[PLAYER_RANK, LEAD_LEARNER_RANK])?)
        } else {
            None
        };

        let mut agent = build_agent(&setup, rank)?;
        let manager = CheckpointManager::new(super::launch::checkpoint_config(&config), rank);
        let mut gradient_steps = 0;
        if let Some(path) = &config.checkpoint.resume_from {
            let record = manager.load_resume(path)?;
            if let Some(bytes) = record.agent_state.as_deref() {
                let state: LearnerState = bincode::deserialize(bytes)?;
                agent.load_state(&state.agent)?;
                gradient_steps = state.gradient_steps;
            }
            info!(rank, path = %path.display(), gradient_steps, "Resuming learner");
        }

        if let Some(pair) = &pair {
            pair.broadcast(
                Some(Payload::Params(agent.player_parameters()?)),
                LEAD_LEARNER_RANK,
            )?;
        }

        let logging = config.metric.log_level > 0;
        let critic = &config.algo.critic;
        Ok(Self {
            target_sync: TargetSync::new(critic.target_network_update_freq, critic.tau),
            metrics: MetricsContext::new(logging),
            timers: Timers::new(logging && !config.metric.disable_timer),
            config,
            agent,
            world,
            optimization,
            pair,
            manager,
            gradient_steps,
            logged_steps: gradient_steps,
            phase: LearnerPhase::AwaitBatch,
        })
    }

    pub fn phase(&self) -> LearnerPhase {
        self.phase
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Run configuration received from the player.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Serve training rounds until the shutdown sentinel arrives.
    pub fn run(mut self) -> Result<LearnerSummary> {
        let rank = self.world.global_rank();
        let mut rounds = 0;
        let mut checkpoints = Vec::new();
        loop {
            self.phase = LearnerPhase::AwaitBatch;
            match self.world.scatter(None, PLAYER_RANK)? {
                Payload::Train(request) => {
                    if let Some(path) = self.train_round(&request)? {
                        checkpoints.push(path);
                    }
                    rounds += 1;
                }
                Payload::Shutdown {
                    policy_step,
                    counters,
                } => {
                    checkpoints.push(self.save_checkpoint(policy_step, counters)?);
                    self.phase = LearnerPhase::Finished;
                    info!(rank, rounds, gradient_steps = self.gradient_steps, "Learner finished");
                    return Ok(LearnerSummary {
                        rank,
                        gradient_steps: self.gradient_steps,
                        rounds,
                        checkpoints,
                    });
                }
                Payload::Abort { reason } => {
                    self.phase = LearnerPhase::Finished;
                    return Err(CollectiveError::Aborted {
                        rank: PLAYER_RANK,
                        reason,
                    }
                    .into());
                }
                other => {
                    return Err(CollectiveError::UnexpectedPayload {
                        expected: "train",
                        actual: other.kind(),
                    }
                    .into())
                }
            }
        }
    }

    fn train_round(&mut self, request: &TrainRequest) -> Result<Option<PathBuf>> {
        self.phase = LearnerPhase::Train;
        let started = Instant::now();
        for batch in &request.batches {
            if let Some(tau) = self.target_sync.tau_for(self.gradient_steps) {
                self.agent.sync_target(tau)?;
            }
            let mut ctx = TrainContext {
                group: self.optimization.as_ref(),
                metrics: &mut self.metrics,
                gradient_step: self.gradient_steps,
            };
            self.agent.train(batch, &mut ctx)?;
            self.gradient_steps += 1;
        }
        self.timers.record(TRAIN_TIME, started.elapsed());
        debug!(
            rank = self.world.global_rank(),
            steps = request.batches.len(),
            policy_step = request.policy_step,
            "Trained on round"
        );

        self.phase = LearnerPhase::PublishParams;
        let metrics = if request.send_metrics {
            self.reduce_metrics()?
        } else {
            None
        };
        if let Some(pair) = &self.pair {
            pair.broadcast(
                Some(Payload::Params(self.agent.player_parameters()?)),
                LEAD_LEARNER_RANK,
            )?;
            if request.send_metrics {
                pair.broadcast(
                    Some(Payload::Metrics(metrics.unwrap_or_default())),
                    LEAD_LEARNER_RANK,
                )?;
            }
        }

        if request.checkpoint {
            return self
                .save_checkpoint(request.policy_step, request.counters)
                .map(Some);
        }
        Ok(None)
    }

    /// Average this round's metrics over the learners; `Some` on rank 1 only.
    fn reduce_metrics(&mut self) -> Result<Option<Metrics>> {
        let mut local = self.metrics.compute();
        let train_time = self.timers.seconds(TRAIN_TIME);
        if train_time > 0.0 {
            // Every learner steps in lockstep, so the global rate scales
            // with the number of learners.
            let steps = (self.gradient_steps - self.logged_steps) * self.optimization.world_size() as u64;
            local.insert("Time/sps_train".into(), steps as f64 / train_time);
        }
        self.metrics.reset();
        self.timers.reset();
        self.logged_steps = self.gradient_steps;

        let Some(parts) = self.optimization.gather(Payload::Metrics(local), 0)? else {
            return Ok(None);
        };
        let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
        for part in parts {
            for (name, value) in part.into_metrics()? {
                let entry = sums.entry(name).or_default();
                entry.0 += value;
                entry.1 += 1;
            }
        }
        Ok(Some(
            sums.into_iter()
                .map(|(name, (sum, n))| (name, sum / n as f64))
                .collect(),
        ))
    }

    fn save_checkpoint(&self, policy_step: u64, counters: Counters) -> Result<PathBuf> {
        let state = LearnerState {
            gradient_steps: self.gradient_steps,
            agent: self.agent.save_state()?,
        };
        let record = CheckpointRecord::new(
            policy_step,
            self.world.global_rank(),
            self.world.world_size(),
            counters,
        )
        .with_agent_state(bincode::serialize(&state)?);
        self.manager.save(&record)
    }
}
