//! Rank 0: environment interaction, replay storage and round scheduling.

use super::{ExplorationSchedule, PlayerAgent};
use crate::buffer::{
    EnvIndependentReplayBuffer, StepData, ACTIONS, DONES, IS_FIRST, PASSTHROUGH_PREFIX, REWARDS,
};
use crate::checkpoint::{CheckpointManager, CheckpointRecord, Counters, ResumePoint};
use crate::comm::{
    CommunicationGroup, Payload, RunSetup, TrainRequest, LEAD_LEARNER_RANK, PLAYER_RANK,
};
use crate::config::RunConfig;
use crate::env::ObsDict;
use crate::log::{MetricLogger, Metrics};
use crate::metrics::{MetricsContext, Timers};
use crate::spaces::DynSpace;
use crate::utils::seed_rank;
use crate::vector::{stack_observations, VecEnvBackend, VecStep};
use crate::{DreamError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{ArrayD, Axis, IxDyn};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

const ENV_TIME: &str = "Time/env_interaction_time";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerPhase {
    /// Random actions until `learning_starts`
    Warmup,
    /// Policy actions
    Acting,
    /// Inside a training round, waiting for parameters from rank 1
    AwaitingParams,
}

/// Player-side state persisted in its checkpoint record.
#[derive(Serialize, Deserialize)]
struct PlayerState {
    exploration: ExplorationSchedule,
}

#[derive(Clone, Debug)]
pub struct PlayerSummary {
    pub policy_step: u64,
    /// Last completed iteration
    pub update: u64,
    pub training_rounds: u64,
    pub exploration: f64,
    pub checkpoints: Vec<PathBuf>,
}

pub struct Player<V: VecEnvBackend, A: PlayerAgent> {
    config: RunConfig,
    envs: V,
    agent: A,
    world: Box<dyn CommunicationGroup>,
    logger: Box<dyn MetricLogger>,
    manager: CheckpointManager,
    metrics: MetricsContext,
    timers: Timers,
    rng: ChaCha8Rng,
    phase: PlayerPhase,
    connected: bool,
}

impl<V: VecEnvBackend, A: PlayerAgent> Player<V, A> {
    pub fn new(
        config: RunConfig,
        envs: V,
        agent: A,
        world: Box<dyn CommunicationGroup>,
        logger: Box<dyn MetricLogger>,
    ) -> Result<Self> {
        if world.rank() != PLAYER_RANK {
            return Err(DreamError::Configuration(format!(
                "the player must run on rank {PLAYER_RANK}, got rank {}",
                world.rank()
            )));
        }
        if world.world_size() < 2 {
            return Err(DreamError::Configuration(
                "the player needs at least one learner rank".into(),
            ));
        }
        if envs.num_envs() != config.env.num_envs {
            return Err(DreamError::Configuration(format!(
                "env.num_envs is {} but the vectorized env has {} lanes",
                config.env.num_envs,
                envs.num_envs()
            )));
        }
        let manager = CheckpointManager::new(super::launch::checkpoint_config(&config), PLAYER_RANK);
        let logging = config.metric.log_level > 0;
        Ok(Self {
            metrics: MetricsContext::new(logging),
            timers: Timers::new(logging && !config.metric.disable_timer),
            rng: seed_rank(config.seed, PLAYER_RANK),
            manager,
            config,
            envs,
            agent,
            world,
            logger,
            phase: PlayerPhase::Warmup,
            connected: false,
        })
    }

    pub fn phase(&self) -> PlayerPhase {
        self.phase
    }

    /// Drive the whole run, then send the shutdown sentinel.
    pub fn run(mut self) -> Result<PlayerSummary> {
        match self.run_loop() {
            Ok(summary) => Ok(summary),
            Err(e) => {
                // Learners parked on the scatter would otherwise wait for the
                // full collective timeout.
                if self.connected && self.phase != PlayerPhase::AwaitingParams {
                    let reason = e.to_string();
                    let abort = vec![Payload::Abort { reason }; self.world.world_size()];
                    if let Err(send) = self.world.scatter(Some(abort), PLAYER_RANK) {
                        warn!("failed to notify learners of the abort: {}", send);
                    }
                }
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> Result<PlayerSummary> {
        let world_size = self.world.world_size();
        let learners = world_size - 1;
        let num_envs = self.envs.num_envs();
        let per_update = self.config.policy_steps_per_update();
        let action_space = self.envs.action_space();
        let action_dim = action_space.encoded_dim();

        let setup = RunSetup {
            config: self.config.clone(),
            observation_space: self.envs.observation_space(),
            action_space: action_space.clone(),
        };
        self.world
            .broadcast(Some(Payload::Setup(Box::new(setup))), PLAYER_RANK)?;
        self.connected = true;
        let pair = self
            .world
            .create_subgroup(&[PLAYER_RANK, LEAD_LEARNER_RANK])?;

        self.phase = PlayerPhase::AwaitingParams;
        let params = pair.broadcast(None, LEAD_LEARNER_RANK)?.into_params()?;
        self.agent.load_parameters(&params)?;
        self.phase = PlayerPhase::Warmup;

        let algo = self.config.algo.clone();
        let num_updates = if self.config.dry_run {
            1
        } else {
            algo.total_steps / per_update
        };
        let learning_starts = if self.config.dry_run {
            0
        } else {
            algo.learning_starts / per_update
        };
        let train_every = (algo.train_every / per_update) as i64;
        let mut exploration = ExplorationSchedule::new(
            algo.actor.expl_amount,
            algo.actor.expl_min,
            algo.actor.expl_decay,
            algo.actor.max_step_expl_decay,
            (algo.per_rank_gradient_steps * learners) as u64,
        );

        let resumed = self.config.checkpoint.resume_from.clone();
        let (resume, mut rb) = match &resumed {
            Some(path) => {
                let record = self.manager.load_resume(path)?;
                let resume = ResumePoint::from_counters(
                    &record.counters,
                    learners,
                    num_envs,
                    learning_starts,
                )?;
                if let Some(state) = record.agent_state.as_deref() {
                    let state: PlayerState = bincode::deserialize(state)?;
                    exploration = state.exploration;
                }
                let buffer = if self.config.buffer.checkpoint {
                    ResumePoint::restore_buffer(&record, world_size, num_envs)?
                } else {
                    None
                };
                info!(
                    path = %path.display(),
                    update = record.counters.update,
                    restored_buffer = buffer.is_some(),
                    "Resuming player"
                );
                let buffer = match buffer {
                    Some(b) => b,
                    None => self.new_buffer(num_envs)?,
                };
                (resume, buffer)
            }
            None => (
                ResumePoint::fresh(algo.per_rank_batch_size, learning_starts),
                self.new_buffer(num_envs)?,
            ),
        };

        let mut policy_step = resume.policy_step;
        let mut last_log = resume.last_log;
        let mut last_checkpoint = resume.last_checkpoint;
        let mut last_update = resume.start_update.saturating_sub(1);
        let mut updates_before_training = train_every;
        let mut training_rounds = 0u64;
        let mut checkpoints = Vec::new();
        let batch_size = resume.per_rank_batch_size * learners;

        let progress = self.progress_bar(num_updates * per_update, policy_step);
        let (reset_obs, _) = self.envs.reset(Some(self.config.seed))?;
        let keys = self.stored_keys(&reset_obs);
        let mut obs = select_keys(&reset_obs, &keys);
        let mut step_data = observation_step(&obs)
            .with(REWARDS, StepData::column(num_envs, 0.0))
            .with(DONES, StepData::column(num_envs, 0.0))
            .with(IS_FIRST, StepData::column(num_envs, 1.0));
        self.agent.reset_lanes(&(0..num_envs).collect::<Vec<_>>())?;

        info!(
            start_update = resume.start_update,
            num_updates,
            learning_starts = resume.learning_starts,
            learners,
            "Player started"
        );

        for update in resume.start_update..=num_updates {
            policy_step += per_update;
            self.phase = if update <= resume.learning_starts && resumed.is_none() {
                PlayerPhase::Warmup
            } else {
                PlayerPhase::Acting
            };

            let started = Instant::now();
            let encoded = match self.phase {
                PlayerPhase::Warmup => random_actions(&action_space, num_envs, &mut self.rng)?,
                _ => self.agent.act(&obs, exploration.amount)?,
            };
            if encoded.shape() != [num_envs, action_dim] {
                return Err(DreamError::ShapeMismatch {
                    key: ACTIONS.into(),
                    expected: vec![num_envs, action_dim],
                    actual: encoded.shape().to_vec(),
                });
            }
            let env_actions = encoded
                .axis_iter(Axis(0))
                .map(|row| action_space.decode_action(&row.iter().copied().collect::<Vec<_>>()))
                .collect::<Result<Vec<_>>>()?;
            step_data.insert(ACTIONS, encoded);
            rb.add(&step_data, None)?;
            let out = self.envs.step(&env_actions)?;
            self.timers.record(ENV_TIME, started.elapsed());

            let (next, reset_lanes) =
                self.record_transition(&mut rb, &out, &keys, action_dim)?;
            step_data = next;
            obs = select_keys(&out.observations, &keys);
            if !reset_lanes.is_empty() {
                self.agent.reset_lanes(&reset_lanes)?;
            }

            updates_before_training -= 1;
            let log_due = self.config.metric.log_level > 0
                && (policy_step.saturating_sub(last_log) >= self.config.metric.log_every
                    || update == num_updates);
            let ckpt_due = self.manager.is_due(policy_step, last_checkpoint) && update < num_updates;

            let mut train_metrics = Metrics::new();
            if update >= resume.learning_starts && updates_before_training <= 0 {
                let gradient_steps = if update == resume.learning_starts {
                    algo.per_rank_pretrain_steps
                } else {
                    algo.per_rank_gradient_steps
                };
                let counters = Counters {
                    update,
                    last_log: if log_due { policy_step } else { last_log },
                    last_checkpoint: if ckpt_due { policy_step } else { last_checkpoint },
                    batch_size,
                };
                self.phase = PlayerPhase::AwaitingParams;
                let samples = rb.sample(
                    resume.per_rank_batch_size,
                    algo.per_rank_sequence_length,
                    gradient_steps * learners,
                    &mut self.rng,
                )?;
                let mut samples = samples.into_iter();
                let mut payloads = vec![Payload::Train(Box::default())];
                for _ in 0..learners {
                    payloads.push(Payload::Train(Box::new(TrainRequest {
                        batches: samples.by_ref().take(gradient_steps).collect(),
                        policy_step,
                        counters,
                        send_metrics: log_due,
                        checkpoint: ckpt_due,
                    })));
                }
                self.world.scatter(Some(payloads), PLAYER_RANK)?;

                let params = pair.broadcast(None, LEAD_LEARNER_RANK)?.into_params()?;
                self.agent.load_parameters(&params)?;
                if log_due {
                    train_metrics = pair.broadcast(None, LEAD_LEARNER_RANK)?.into_metrics()?;
                }
                self.phase = PlayerPhase::Acting;
                training_rounds += 1;
                updates_before_training = train_every;

                let amount = exploration.step();
                self.metrics.update("Params/exploration_amount", amount);

                if ckpt_due {
                    last_checkpoint = policy_step;
                    checkpoints.push(self.save_checkpoint(&rb, &exploration, policy_step, counters)?);
                }
                debug!(update, policy_step, gradient_steps, "Training round complete");
            }

            if log_due {
                let mut metrics = self.metrics.compute();
                metrics.extend(train_metrics);
                let env_time = self.timers.seconds(ENV_TIME);
                if env_time > 0.0 {
                    let steps = policy_step.saturating_sub(last_log) as f64
                        * self.config.env.action_repeat as f64;
                    metrics.insert("Time/sps_env_interaction".into(), steps / env_time);
                }
                self.logger.log_metrics(&metrics, policy_step);
                if let Some(pb) = &progress {
                    let reward = metrics.get("Rewards/rew_avg").copied().unwrap_or(f64::NAN);
                    pb.set_message(format!("Reward: {:.2}", reward));
                }
                self.metrics.reset();
                self.timers.reset();
                last_log = policy_step;
            }
            if let Some(pb) = &progress {
                pb.set_position(policy_step);
            }
            last_update = update;
        }

        // Shutdown sentinel: each learner writes its final checkpoint and returns.
        // `save_last` only governs the player's own record.
        let save_last = self.config.checkpoint.save_last;
        let counters = Counters {
            update: last_update,
            last_log,
            last_checkpoint: if save_last { policy_step } else { last_checkpoint },
            batch_size,
        };
        let sentinel = vec![
            Payload::Shutdown {
                policy_step,
                counters
            };
            world_size
        ];
        self.world.scatter(Some(sentinel), PLAYER_RANK)?;
        if save_last {
            checkpoints.push(self.save_checkpoint(&rb, &exploration, policy_step, counters)?);
        }

        self.envs.close();
        self.logger.close();
        if let Some(pb) = progress {
            pb.finish_with_message("Training complete");
        }
        info!(policy_step, training_rounds, "Player finished");

        Ok(PlayerSummary {
            policy_step,
            update: last_update,
            training_rounds,
            exploration: exploration.amount,
            checkpoints,
        })
    }

    /// Turn the outcome of one vectorized step into the next pending step,
    /// inserting terminal observations for finished lanes.
    ///
    /// Returns the pending step and the lanes that started a new episode.
    fn record_transition(
        &mut self,
        rb: &mut EnvIndependentReplayBuffer,
        out: &VecStep,
        keys: &[String],
        action_dim: usize,
    ) -> Result<(StepData, Vec<usize>)> {
        let num_envs = out.rewards.len();
        let dones = out.dones();
        let mut is_first = vec![0.0f32; num_envs];

        for (lane, info) in out.infos.iter().enumerate() {
            if info.restart_on_exception && !dones[lane] {
                warn!(lane, "environment was rebuilt mid-episode, closing the stored episode");
                rb.mark_restart_boundary(lane)?;
                is_first[lane] = 1.0;
            }
            if dones[lane] {
                if let (Some(ret), Some(len)) = (info.episode_return, info.episode_length) {
                    self.metrics.update("Rewards/rew_avg", ret as f64);
                    self.metrics.update("Game/ep_len_avg", len as f64);
                    debug!(lane, episode_return = ret, episode_length = len, "Episode finished");
                }
            }
        }

        let clip = self.config.env.clip_rewards;
        let rewards: Vec<f32> = out
            .rewards
            .iter()
            .map(|&r| if clip { r.tanh() } else { r })
            .collect();
        let done_values: Vec<f32> = dones.iter().map(|&d| if d { 1.0 } else { 0.0 }).collect();

        let mut next = observation_step(&select_keys(&out.observations, keys))
            .with(REWARDS, StepData::column_from(&rewards))
            .with(DONES, StepData::column_from(&done_values))
            .with(IS_FIRST, StepData::column_from(&is_first));

        let finished = out.done_lanes();
        if finished.is_empty() {
            return Ok((next, finished));
        }

        // Terminal observation with done = 1, then the lane restarts
        let terminal = finished
            .iter()
            .map(|&lane| match &out.final_observations[lane] {
                Some(final_obs) => Ok(select_keys(final_obs, keys)),
                None => lane_observation(&out.observations, lane, keys),
            })
            .collect::<Result<Vec<_>>>()?;
        let k = finished.len();
        let terminal_rewards: Vec<f32> = finished.iter().map(|&l| rewards[l]).collect();
        let reset_data = observation_step(&stack_observations(&terminal)?)
            .with(ACTIONS, ArrayD::zeros(IxDyn(&[k, action_dim])))
            .with(REWARDS, StepData::column_from(&terminal_rewards))
            .with(DONES, StepData::column(k, 1.0))
            .with(IS_FIRST, StepData::column(k, 0.0));
        rb.add(&reset_data, Some(&finished))?;

        for &lane in &finished {
            next.fill_row(REWARDS, lane, 0.0)?;
            next.fill_row(DONES, lane, 0.0)?;
            next.fill_row(IS_FIRST, lane, 1.0)?;
        }
        Ok((next, finished))
    }

    fn save_checkpoint(
        &self,
        rb: &EnvIndependentReplayBuffer,
        exploration: &ExplorationSchedule,
        policy_step: u64,
        counters: Counters,
    ) -> Result<PathBuf> {
        let state = PlayerState {
            exploration: exploration.clone(),
        };
        let mut record = CheckpointRecord::new(
            policy_step,
            PLAYER_RANK,
            self.world.world_size(),
            counters,
        )
        .with_agent_state(bincode::serialize(&state)?);
        if self.config.buffer.checkpoint {
            record = record.with_buffer_state(bincode::serialize(rb)?);
        }
        self.manager.save(&record)
    }

    fn new_buffer(&self, num_envs: usize) -> Result<EnvIndependentReplayBuffer> {
        EnvIndependentReplayBuffer::new(self.config.buffer_capacity_per_lane(), num_envs)
    }

    /// Encoder keys plus any passthrough keys the environment emits.
    fn stored_keys(&self, obs: &ObsDict) -> Vec<String> {
        let mut keys = self.config.encoder_keys();
        keys.extend(
            obs.keys()
                .filter(|k| k.starts_with(PASSTHROUGH_PREFIX))
                .cloned(),
        );
        keys
    }

    fn progress_bar(&self, total: u64, position: u64) -> Option<ProgressBar> {
        if total == 0 || self.config.metric.log_level == 0 {
            return None;
        }
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_position(position);
        Some(pb)
    }
}

/// `[N, A]` encoded random actions, one space sample per lane.
fn random_actions(space: &DynSpace, num_envs: usize, rng: &mut ChaCha8Rng) -> Result<ArrayD<f32>> {
    let mut flat = Vec::with_capacity(num_envs * space.encoded_dim());
    for _ in 0..num_envs {
        flat.extend(space.encode_action(&space.sample(rng))?);
    }
    ArrayD::from_shape_vec(IxDyn(&[num_envs, space.encoded_dim()]), flat)
        .map_err(|e| DreamError::Env(e.to_string()))
}

fn select_keys(obs: &ObsDict, keys: &[String]) -> ObsDict {
    obs.iter()
        .filter(|(k, _)| keys.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn lane_observation(obs: &ObsDict, lane: usize, keys: &[String]) -> Result<ObsDict> {
    keys.iter()
        .filter(|k| obs.contains_key(*k))
        .map(|k| {
            let value = &obs[k];
            if lane >= value.shape()[0] {
                return Err(DreamError::ShapeMismatch {
                    key: k.clone(),
                    expected: vec![lane + 1],
                    actual: value.shape().to_vec(),
                });
            }
            Ok((k.clone(), value.index_axis(Axis(0), lane).to_owned()))
        })
        .collect()
}

fn observation_step(obs: &ObsDict) -> StepData {
    obs.iter()
        .fold(StepData::new(), |step, (k, v)| step.with(k.clone(), v.clone()))
}
