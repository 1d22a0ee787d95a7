//! One Dreamer gradient step: world model, then actor and critic on
//! imagined trajectories.

use super::agent::{Actor, WorldModel, PLAYER_MODULES};
use super::config::DreamerConfig;
use super::distributions::symexp;
use super::loss::{
    bernoulli_log_prob, lambda_values, mse_log_prob, reconstruction_loss, symlog_mse_log_prob,
};
use super::models::{DenseHead, TensorDict};
use super::moments::Moments;
use super::optim::{Adam, AdamState};
use super::params::{
    array_to_tensor, flatten_parameters, load_flat_parameters, parameter_count, soft_update,
    StoreSnapshot,
};
use super::registry::ModelRegistry;
use super::rssm::LatentState;
use crate::buffer::{SequenceBatch, ACTIONS, DONES, IS_FIRST, REWARDS};
use crate::checkpoint::Checkpointable;
use crate::comm::{CommunicationGroup, Payload, RunSetup};
use crate::coordinator::{LearnerAgent, TrainContext};
use crate::{DreamError, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, info};

/// Scale raw `[0, 255]` pixels to `[-0.5, 0.5]`.
pub(crate) fn scale_image(pixels: &Tensor) -> Tensor {
    pixels / 255.0 - 0.5
}

/// Encoder inputs with their leading dimensions untouched.
pub(crate) fn observation_tensors<'a, F>(config: &DreamerConfig, device: Device, mut get: F) -> Result<TensorDict>
where
    F: FnMut(&str) -> Result<&'a ndarray::ArrayD<f32>>,
{
    let mut obs = TensorDict::new();
    for (key, _) in &config.cnn_encoder {
        obs.insert(key.clone(), scale_image(&array_to_tensor(get(key)?, device)));
    }
    for (key, _) in &config.mlp_encoder {
        obs.insert(key.clone(), array_to_tensor(get(key)?, device));
    }
    Ok(obs)
}

fn scalar(t: &Tensor) -> f64 {
    t.double_value(&[])
}

/// Mean entropy of latent categoricals given normalized logits `[.., S, D]`.
fn latent_entropy(logits: &Tensor) -> f64 {
    let per_state = -(logits.exp() * logits).sum_dim_intlist([-2i64, -1].as_slice(), false, Kind::Float);
    scalar(&per_state.mean(Kind::Float))
}

/// Backward, average across learners, clip, step.
fn optimize(
    opt: &mut Adam,
    loss: &Tensor,
    clip: Option<f64>,
    strict: bool,
    ctx: &mut TrainContext<'_>,
    metric: &str,
) -> Result<()> {
    opt.zero_grad();
    loss.backward();
    opt.all_reduce_gradients(ctx.group)?;
    if let Some(max_norm) = clip.filter(|c| *c > 0.0) {
        let norm = opt.clip_grad_norm(max_norm, strict, ctx.metrics)?;
        ctx.metrics.update(metric, norm);
    }
    opt.step();
    Ok(())
}

/// Everything a learner needs to continue training exactly.
#[derive(Serialize, Deserialize)]
struct TrainerState {
    world_model: StoreSnapshot,
    actor: StoreSnapshot,
    critic: StoreSnapshot,
    target_critic: StoreSnapshot,
    world_optimizer: AdamState,
    actor_optimizer: AdamState,
    critic_optimizer: AdamState,
    moments: Moments,
}

pub struct DreamerTrainer {
    config: DreamerConfig,
    device: Device,
    world_vs: nn::VarStore,
    actor_vs: nn::VarStore,
    critic_vs: nn::VarStore,
    target_vs: nn::VarStore,
    world_model: WorldModel,
    actor: Actor,
    critic: DenseHead,
    target_critic: DenseHead,
    world_opt: Adam,
    actor_opt: Adam,
    critic_opt: Adam,
    moments: Moments,
}

impl DreamerTrainer {
    pub fn new(
        config: DreamerConfig,
        registry: &ModelRegistry,
        architecture: &str,
        device: Device,
    ) -> Result<Self> {
        let world_vs = nn::VarStore::new(device);
        let actor_vs = nn::VarStore::new(device);
        let critic_vs = nn::VarStore::new(device);
        let target_vs = nn::VarStore::new(device);

        let world_model = WorldModel::new(&world_vs.root(), &config, registry, architecture)?;
        let actor = Actor::new(&actor_vs.root(), &config);
        let latent = config.latent_size();
        let critic = DenseHead::new(&critic_vs.root(), latent, 1, config.mlp_layers, config.dense_units);
        let target_critic = DenseHead::new(&target_vs.root(), latent, 1, config.mlp_layers, config.dense_units);
        soft_update(&critic_vs, &target_vs, 1.0)?;

        let wm = &config.world_model;
        let world_opt = Adam::new(&world_vs, wm.lr, wm.eps);
        let actor_opt = Adam::new(&actor_vs, config.actor.lr, config.actor.eps);
        let critic_opt = Adam::new(&critic_vs, config.critic.lr, config.critic.eps);
        let moments = Moments::new(&config.actor.moments);

        info!(
            world_model = parameter_count(&world_vs, &[]),
            actor = parameter_count(&actor_vs, &[]),
            critic = parameter_count(&critic_vs, &[]),
            ?device,
            "Built Dreamer networks"
        );
        Ok(Self {
            config,
            device,
            world_vs,
            actor_vs,
            critic_vs,
            target_vs,
            world_model,
            actor,
            critic,
            target_critic,
            world_opt,
            actor_opt,
            critic_opt,
            moments,
        })
    }

    pub fn config(&self) -> &DreamerConfig {
        &self.config
    }

    pub fn moments(&self) -> &Moments {
        &self.moments
    }

    fn stores(&self) -> [&nn::VarStore; 4] {
        [&self.world_vs, &self.actor_vs, &self.critic_vs, &self.target_vs]
    }

    /// Encoder and RSSM weights followed by the actor's.
    pub fn player_parameters(&self) -> Result<Vec<f32>> {
        let mut flat = flatten_parameters(&self.world_vs, &PLAYER_MODULES)?;
        flat.extend(flatten_parameters(&self.actor_vs, &[])?);
        Ok(flat)
    }

    pub fn sync_target(&self, tau: f64) -> Result<()> {
        soft_update(&self.critic_vs, &self.target_vs, tau)
    }

    /// Overwrite every network with the weights of group rank 0.
    pub fn broadcast_parameters(&self, group: &dyn CommunicationGroup) -> Result<()> {
        if group.world_size() < 2 {
            return Ok(());
        }
        let payload = if group.rank() == 0 {
            let mut flat = Vec::new();
            for vs in self.stores() {
                flat.extend(flatten_parameters(vs, &[])?);
            }
            Some(Payload::Tensor(flat))
        } else {
            None
        };
        let flat = group.broadcast(payload, 0)?.into_tensor()?;
        let expected: usize = self.stores().iter().map(|vs| parameter_count(vs, &[])).sum();
        if flat.len() != expected {
            return Err(DreamError::ShapeMismatch {
                key: "params".into(),
                expected: vec![expected],
                actual: vec![flat.len()],
            });
        }
        let mut offset = 0;
        for vs in self.stores() {
            let n = parameter_count(vs, &[]);
            load_flat_parameters(vs, &[], &flat[offset..offset + n])?;
            offset += n;
        }
        Ok(())
    }

    /// One gradient step on a `[T, B, ...]` batch. Returns the detached
    /// imagined trajectory `[horizon + 1, T * B, latent]`.
    pub fn train_step(&mut self, batch: &SequenceBatch, ctx: &mut TrainContext<'_>) -> Result<Tensor> {
        let dev = self.device;
        let (seq_len, batch_size) = (batch.seq_len() as i64, batch.batch_size() as i64);
        let rows = seq_len * batch_size;
        let strict = self.config.strict_gradients;

        // World model
        let obs = observation_tensors(&self.config, dev, |key| batch.get(key))?;
        let flat_obs: TensorDict = obs.iter().map(|(k, v)| (k.clone(), v.flatten(0, 1))).collect();
        let embedded = self.world_model.encoder.encode(&flat_obs)?.reshape([seq_len, batch_size, -1]);

        let actions = array_to_tensor(batch.get(ACTIONS)?, dev);
        let prev_actions = Tensor::cat(
            &[actions.narrow(0, 0, 1).zeros_like(), actions.narrow(0, 0, seq_len - 1)],
            0,
        );
        let is_first = array_to_tensor(batch.get(IS_FIRST)?, dev);
        let rewards = array_to_tensor(batch.get(REWARDS)?, dev);
        let dones = array_to_tensor(batch.get(DONES)?, dev);
        let continue_targets = 1.0 - &dones;

        let mut state = LatentState::zeros(&self.config, batch_size, dev);
        let capacity = seq_len as usize;
        let (mut recurrents, mut posteriors) = (Vec::with_capacity(capacity), Vec::with_capacity(capacity));
        let (mut posterior_logits, mut prior_logits) = (Vec::with_capacity(capacity), Vec::with_capacity(capacity));
        for t in 0..seq_len {
            let step = self.world_model.rssm.dynamic(
                &state.stochastic,
                &state.recurrent,
                &prev_actions.get(t),
                &embedded.get(t),
                &is_first.get(t),
            );
            state = LatentState {
                recurrent: step.recurrent.shallow_clone(),
                stochastic: step.posterior.shallow_clone(),
            };
            recurrents.push(step.recurrent);
            posteriors.push(step.posterior);
            posterior_logits.push(step.posterior_logits);
            prior_logits.push(step.prior_logits);
        }
        let recurrents = Tensor::stack(&recurrents, 0);
        let posteriors = Tensor::stack(&posteriors, 0);
        let posterior_logits = Tensor::stack(&posterior_logits, 0);
        let prior_logits = Tensor::stack(&prior_logits, 0);
        let latent = Tensor::cat(&[posteriors.flatten(-2, -1), recurrents.shallow_clone()], -1);

        let reconstructions = self.world_model.decoder.decode(&latent.flatten(0, 1));
        let mut observation_log_prob = Tensor::zeros([rows], (Kind::Float, dev));
        let decoded = self
            .config
            .cnn_decoder
            .iter()
            .map(|k| (k, 3))
            .chain(self.config.mlp_decoder.iter().map(|k| (k, 1)));
        for (key, event_dims) in decoded {
            let missing = || DreamError::MissingKey(key.clone());
            let prediction = reconstructions.get(key).ok_or_else(missing)?;
            let target = flat_obs.get(key).ok_or_else(missing)?;
            let log_prob = if event_dims == 3 {
                mse_log_prob(prediction, target, 3)
            } else {
                symlog_mse_log_prob(prediction, &target.flatten(1, -1), 1)
            };
            observation_log_prob = observation_log_prob + log_prob;
        }
        let observation_log_prob = observation_log_prob.reshape([seq_len, batch_size]);
        let reward_log_prob = symlog_mse_log_prob(&self.world_model.reward.forward(&latent), &rewards, 1);
        let continue_log_prob =
            bernoulli_log_prob(&self.world_model.continue_head.forward(&latent), &continue_targets);

        let wm_loss = reconstruction_loss(
            &observation_log_prob,
            &reward_log_prob,
            &continue_log_prob,
            &posterior_logits,
            &prior_logits,
            &self.config.world_model,
        );
        optimize(
            &mut self.world_opt,
            &wm_loss.total,
            self.config.world_model.clip_gradients,
            strict,
            ctx,
            "Grads/world_model",
        )?;

        // Imagination from every posterior state
        let stoch = [self.config.stochastic_size, self.config.discrete_size];
        let mut prior = posteriors.detach().reshape([rows, stoch[0], stoch[1]]);
        let mut recurrent = recurrents.detach().reshape([rows, -1]);
        let mut features = Tensor::cat(&[prior.flatten(-2, -1), recurrent.shallow_clone()], -1);
        let (mut action, _) = self.actor.forward(&features.detach(), false);
        let horizon = self.config.horizon as i64;
        let mut trajectory = vec![features.shallow_clone()];
        let mut imagined_actions = vec![action.shallow_clone()];
        for _ in 0..horizon {
            let (next_prior, next_recurrent) = self.world_model.rssm.imagination(&prior, &recurrent, &action);
            prior = next_prior;
            recurrent = next_recurrent;
            features = Tensor::cat(&[prior.flatten(-2, -1), recurrent.shallow_clone()], -1);
            action = self.actor.forward(&features.detach(), false).0;
            trajectory.push(features.shallow_clone());
            imagined_actions.push(action.shallow_clone());
        }
        let trajectory = Tensor::stack(&trajectory, 0);
        let imagined_actions = Tensor::stack(&imagined_actions, 0);

        // Actor
        let gamma = self.config.gamma;
        let predicted_values = symexp(&self.critic.forward(&trajectory));
        let predicted_rewards = symexp(&self.world_model.reward.forward(&trajectory));
        let predicted_continues = self
            .world_model
            .continue_head
            .forward(&trajectory)
            .gt(0.0)
            .to_kind(Kind::Float);
        let continues = Tensor::cat(
            &[
                continue_targets.reshape([1, rows, 1]),
                predicted_continues.narrow(0, 1, horizon),
            ],
            0,
        );
        let lambda = lambda_values(
            &predicted_rewards.narrow(0, 1, horizon),
            &predicted_values.narrow(0, 1, horizon),
            &(continues.narrow(0, 1, horizon) * gamma),
            self.config.lmbda,
        );
        let discount = ((continues * gamma).cumprod(0, Kind::Float) / gamma).detach();
        let discount = discount.narrow(0, 0, horizon);

        let (offset, invscale) = self.moments.update(&lambda, ctx.group)?;
        let baseline = predicted_values.narrow(0, 0, horizon);
        let advantage = (&lambda - offset) / invscale - (baseline - offset) / invscale;
        let policy = self.actor.distribution(&trajectory.detach());
        let objective = if self.config.is_continuous {
            advantage
        } else {
            policy
                .log_prob(&imagined_actions.detach(), self.actor.actions_dim())
                .narrow(0, 0, horizon)
                .unsqueeze(-1)
                * advantage.detach()
        };
        let entropy = policy.entropy().narrow(0, 0, horizon).unsqueeze(-1) * self.config.actor.ent_coef;
        let policy_loss = -(&discount * (objective + &entropy)).mean(Kind::Float);
        optimize(
            &mut self.actor_opt,
            &policy_loss,
            self.config.actor.clip_gradients,
            strict,
            ctx,
            "Grads/actor",
        )?;

        // Critic
        let start_states = trajectory.detach().narrow(0, 0, horizon);
        let values = self.critic.forward(&start_states);
        let target_values = tch::no_grad(|| symexp(&self.target_critic.forward(&start_states)));
        let value_log_prob = symlog_mse_log_prob(&values, &lambda.detach(), 1)
            + symlog_mse_log_prob(&values, &target_values, 1);
        let value_loss = -(value_log_prob * discount.squeeze_dim(-1)).mean(Kind::Float);
        optimize(
            &mut self.critic_opt,
            &value_loss,
            self.config.critic.clip_gradients,
            strict,
            ctx,
            "Grads/critic",
        )?;

        let metrics = &mut *ctx.metrics;
        if metrics.is_enabled() {
            metrics.update("Loss/world_model_loss", scalar(&wm_loss.total));
            metrics.update("Loss/observation_loss", scalar(&wm_loss.observation_loss));
            metrics.update("Loss/reward_loss", scalar(&wm_loss.reward_loss));
            metrics.update("Loss/state_loss", scalar(&wm_loss.state_loss));
            metrics.update("Loss/continue_loss", scalar(&wm_loss.continue_loss));
            metrics.update("State/kl", scalar(&wm_loss.kl));
            metrics.update("State/post_entropy", latent_entropy(&posterior_logits.detach()));
            metrics.update("State/prior_entropy", latent_entropy(&prior_logits.detach()));
            metrics.update("Loss/policy_loss", scalar(&policy_loss));
            metrics.update("Loss/value_loss", scalar(&value_loss));
        }
        debug!(
            gradient_step = ctx.gradient_step,
            world_model_loss = scalar(&wm_loss.total),
            "Dreamer step"
        );
        Ok(trajectory.detach())
    }

    fn state(&self) -> Result<TrainerState> {
        Ok(TrainerState {
            world_model: StoreSnapshot::capture(&self.world_vs)?,
            actor: StoreSnapshot::capture(&self.actor_vs)?,
            critic: StoreSnapshot::capture(&self.critic_vs)?,
            target_critic: StoreSnapshot::capture(&self.target_vs)?,
            world_optimizer: self.world_opt.state()?,
            actor_optimizer: self.actor_opt.state()?,
            critic_optimizer: self.critic_opt.state()?,
            moments: self.moments.clone(),
        })
    }

    fn restore(&mut self, state: TrainerState) -> Result<()> {
        state.world_model.restore(&self.world_vs)?;
        state.actor.restore(&self.actor_vs)?;
        state.critic.restore(&self.critic_vs)?;
        state.target_critic.restore(&self.target_vs)?;
        self.world_opt.load_state(&state.world_optimizer)?;
        self.actor_opt.load_state(&state.actor_optimizer)?;
        self.critic_opt.load_state(&state.critic_optimizer)?;
        self.moments = state.moments;
        Ok(())
    }
}

/// [`DreamerTrainer`] bound to a learner rank.
pub struct DreamerLearner {
    trainer: DreamerTrainer,
    /// Weights agree with group rank 0
    synchronized: bool,
}

impl DreamerLearner {
    pub fn new(setup: &RunSetup, rank: usize) -> Result<Self> {
        Self::with_registry(setup, rank, &ModelRegistry::with_defaults())
    }

    pub fn with_registry(setup: &RunSetup, rank: usize, registry: &ModelRegistry) -> Result<Self> {
        let config = DreamerConfig::from_setup(setup)?;
        tch::manual_seed(config.seed.wrapping_add(rank as u64) as i64);
        let trainer = DreamerTrainer::new(
            config,
            registry,
            &setup.config.algo.architecture,
            Device::cuda_if_available(),
        )?;
        Ok(Self {
            trainer,
            synchronized: false,
        })
    }

    pub fn trainer(&self) -> &DreamerTrainer {
        &self.trainer
    }
}

impl LearnerAgent for DreamerLearner {
    fn train(&mut self, batch: &SequenceBatch, ctx: &mut TrainContext<'_>) -> Result<()> {
        if !self.synchronized {
            self.trainer.broadcast_parameters(ctx.group)?;
            self.synchronized = true;
        }
        self.trainer.train_step(batch, ctx).map(|_| ())
    }

    fn sync_target(&mut self, tau: f64) -> Result<()> {
        self.trainer.sync_target(tau)
    }

    fn player_parameters(&self) -> Result<Vec<f32>> {
        self.trainer.player_parameters()
    }
}

impl Checkpointable for DreamerLearner {
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.trainer.state()?)?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let state: TrainerState = bincode::deserialize(data)?;
        self.trainer.restore(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dreamer::tests::{random_batch, solo_group, tiny_pixel_setup, tiny_setup};
    use crate::metrics::MetricsContext;

    fn cpu_learner(setup: &RunSetup, seed: i64) -> DreamerLearner {
        tch::manual_seed(seed);
        let config = DreamerConfig::from_setup(setup).unwrap();
        let trainer = DreamerTrainer::new(config, &ModelRegistry::with_defaults(), "standard", Device::Cpu).unwrap();
        DreamerLearner {
            trainer,
            synchronized: false,
        }
    }

    fn train_once(learner: &mut DreamerLearner, setup: &RunSetup) -> (Tensor, MetricsContext) {
        let group = solo_group();
        let mut metrics = MetricsContext::new(true);
        let batch = random_batch(setup, 4, 2);
        let mut ctx = TrainContext {
            group: &group,
            metrics: &mut metrics,
            gradient_step: 0,
        };
        let trajectory = learner.trainer.train_step(&batch, &mut ctx).unwrap();
        (trajectory, metrics)
    }

    fn max_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_train_step_returns_imagined_trajectory() {
        let setup = tiny_setup(false);
        let mut learner = cpu_learner(&setup, 0);
        let (trajectory, metrics) = train_once(&mut learner, &setup);
        let config = learner.trainer.config();
        // horizon 3, T * B = 8
        assert_eq!(trajectory.size(), vec![4, 8, config.latent_size()]);
        assert!(!trajectory.requires_grad());

        let metrics = metrics.compute();
        for name in [
            "Loss/world_model_loss",
            "Loss/observation_loss",
            "Loss/policy_loss",
            "Loss/value_loss",
            "State/kl",
            "Grads/world_model",
        ] {
            assert!(metrics.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_train_step_with_pixels_and_continuous_actions() {
        let setup = tiny_pixel_setup();
        let mut learner = cpu_learner(&setup, 0);
        let (trajectory, _) = train_once(&mut learner, &setup);
        assert_eq!(trajectory.size()[0], 4);

        let setup = tiny_setup(true);
        let mut learner = cpu_learner(&setup, 0);
        let (trajectory, metrics) = train_once(&mut learner, &setup);
        assert_eq!(trajectory.size()[1], 8);
        assert!(metrics.compute()["Loss/world_model_loss"].is_finite());
    }

    #[test]
    fn test_training_changes_player_parameters() {
        let setup = tiny_setup(false);
        let mut learner = cpu_learner(&setup, 0);
        let before = learner.player_parameters().unwrap();
        train_once(&mut learner, &setup);
        let after = learner.player_parameters().unwrap();
        assert_eq!(before.len(), after.len());
        assert!(max_diff(&before, &after) > 0.0);
    }

    #[test]
    fn test_target_starts_as_critic_copy() {
        let setup = tiny_setup(false);
        let mut learner = cpu_learner(&setup, 0);
        let trainer = &learner.trainer;
        assert_eq!(
            flatten_parameters(&trainer.critic_vs, &[]).unwrap(),
            flatten_parameters(&trainer.target_vs, &[]).unwrap()
        );
        train_once(&mut learner, &setup);
        let trainer = &learner.trainer;
        let critic = flatten_parameters(&trainer.critic_vs, &[]).unwrap();
        assert!(max_diff(&critic, &flatten_parameters(&trainer.target_vs, &[]).unwrap()) > 0.0);
        learner.sync_target(1.0).unwrap();
        assert_eq!(flatten_parameters(&learner.trainer.target_vs, &[]).unwrap(), critic);
    }

    #[test]
    fn test_checkpoint_restores_weights_optimizer_and_moments() {
        let setup = tiny_setup(false);
        let mut learner = cpu_learner(&setup, 0);
        train_once(&mut learner, &setup);
        let bytes = learner.save_state().unwrap();

        let mut restored = cpu_learner(&setup, 7);
        assert!(max_diff(&restored.player_parameters().unwrap(), &learner.player_parameters().unwrap()) > 0.0);
        restored.load_state(&bytes).unwrap();
        assert_eq!(restored.player_parameters().unwrap(), learner.player_parameters().unwrap());
        assert_eq!(restored.trainer.moments(), learner.trainer.moments());
        assert_eq!(restored.trainer.world_opt.state().unwrap().step, 1);
        assert_eq!(
            restored.trainer.critic_opt.state().unwrap().exp_avg,
            learner.trainer.critic_opt.state().unwrap().exp_avg
        );
    }

    #[test]
    fn test_corrupt_checkpoint_is_rejected() {
        let setup = tiny_setup(false);
        let mut learner = cpu_learner(&setup, 0);
        let err = learner.load_state(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DreamError::Serialization(_)));
    }

    #[test]
    fn test_player_parameter_layout() {
        let setup = tiny_setup(false);
        let learner = cpu_learner(&setup, 0);
        let trainer = &learner.trainer;
        let expected = parameter_count(&trainer.world_vs, &PLAYER_MODULES) + parameter_count(&trainer.actor_vs, &[]);
        assert_eq!(learner.player_parameters().unwrap().len(), expected);
    }
}
