//! Acting with the latest published encoder, RSSM and actor.

use super::agent::{add_exploration_noise, Actor, WorldModel, PLAYER_MODULES};
use super::config::DreamerConfig;
use super::params::{load_flat_parameters, parameter_count, tensor_to_array};
use super::registry::ModelRegistry;
use super::rssm::LatentState;
use super::trainer::observation_tensors;
use crate::comm::RunSetup;
use crate::coordinator::PlayerAgent;
use crate::env::ObsDict;
use crate::{DreamError, Result};
use ndarray::ArrayD;
use tch::{nn, Device, Kind, Tensor};

pub struct DreamerPlayer {
    config: DreamerConfig,
    device: Device,
    world_vs: nn::VarStore,
    actor_vs: nn::VarStore,
    world_model: WorldModel,
    actor: Actor,
    /// Per-lane posterior state, `[N, ..]`
    state: LatentState,
    /// Last encoded action per lane
    actions: Tensor,
    /// `[N, 1]`, set for lanes whose state must be discarded on the next step
    is_first: Tensor,
    greedy: bool,
}

impl DreamerPlayer {
    pub fn new(setup: &RunSetup) -> Result<Self> {
        Self::with_registry(setup, &ModelRegistry::with_defaults())
    }

    pub fn with_registry(setup: &RunSetup, registry: &ModelRegistry) -> Result<Self> {
        let config = DreamerConfig::from_setup(setup)?;
        let device = Device::cuda_if_available();
        let world_vs = nn::VarStore::new(device);
        let actor_vs = nn::VarStore::new(device);
        let world_model = WorldModel::new(&world_vs.root(), &config, registry, &setup.config.algo.architecture)?;
        let actor = Actor::new(&actor_vs.root(), &config);
        let mut player = Self {
            state: LatentState::zeros(&config, 0, device),
            actions: Tensor::zeros([0, config.action_size()], (Kind::Float, device)),
            is_first: Tensor::ones([0, 1], (Kind::Float, device)),
            config,
            device,
            world_vs,
            actor_vs,
            world_model,
            actor,
            greedy: false,
        };
        player.resize(setup.config.env.num_envs as i64);
        Ok(player)
    }

    /// Act with the distribution's mode instead of sampling.
    pub fn with_greedy(mut self, greedy: bool) -> Self {
        self.greedy = greedy;
        self
    }

    pub fn num_lanes(&self) -> i64 {
        self.is_first.size()[0]
    }

    /// Forget every lane and start over with `lanes` fresh ones.
    fn resize(&mut self, lanes: i64) {
        let opts = (Kind::Float, self.device);
        self.state = LatentState::zeros(&self.config, lanes, self.device);
        self.actions = Tensor::zeros([lanes, self.config.action_size()], opts);
        self.is_first = Tensor::ones([lanes, 1], opts);
    }

    fn expected_parameters(&self) -> usize {
        parameter_count(&self.world_vs, &PLAYER_MODULES) + parameter_count(&self.actor_vs, &[])
    }

    /// Recurrent state of every lane, for inspection.
    pub fn recurrent_state(&self) -> &Tensor {
        &self.state.recurrent
    }
}

impl PlayerAgent for DreamerPlayer {
    fn act(&mut self, observations: &ObsDict, exploration: f64) -> Result<ArrayD<f32>> {
        let lanes = observations
            .values()
            .next()
            .map(|v| v.shape()[0] as i64)
            .ok_or_else(|| DreamError::MissingKey("observations".into()))?;
        if lanes != self.num_lanes() {
            self.resize(lanes);
        }
        let obs = observation_tensors(&self.config, self.device, |key| {
            observations
                .get(key)
                .ok_or_else(|| DreamError::MissingKey(key.to_string()))
        })?;

        let actions = tch::no_grad(|| -> Result<Tensor> {
            let embedded = self.world_model.encoder.encode(&obs)?;
            let step = self.world_model.rssm.dynamic(
                &self.state.stochastic,
                &self.state.recurrent,
                &self.actions,
                &embedded,
                &self.is_first,
            );
            self.state = LatentState {
                recurrent: step.recurrent,
                stochastic: step.posterior,
            };
            let (actions, _) = self.actor.forward(&self.state.features(), self.greedy);
            Ok(add_exploration_noise(
                &actions.detach(),
                exploration,
                self.actor.actions_dim(),
                self.config.is_continuous,
            ))
        })?;
        self.actions = actions.shallow_clone();
        let _ = self.is_first.zero_();
        tensor_to_array(&actions)
    }

    fn reset_lanes(&mut self, lanes: &[usize]) -> Result<()> {
        let needed = lanes.iter().max().map_or(0, |&l| l as i64 + 1);
        if needed > self.num_lanes() {
            self.resize(needed);
        }
        for &lane in lanes {
            let _ = self.is_first.get(lane as i64).fill_(1.0);
        }
        Ok(())
    }

    fn load_parameters(&mut self, values: &[f32]) -> Result<()> {
        let expected = self.expected_parameters();
        if values.len() != expected {
            return Err(DreamError::ShapeMismatch {
                key: "params".into(),
                expected: vec![expected],
                actual: vec![values.len()],
            });
        }
        let split = parameter_count(&self.world_vs, &PLAYER_MODULES);
        load_flat_parameters(&self.world_vs, &PLAYER_MODULES, &values[..split])?;
        load_flat_parameters(&self.actor_vs, &[], &values[split..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LearnerAgent;
    use crate::dreamer::tests::{tiny_pixel_setup, tiny_setup};
    use crate::dreamer::DreamerLearner;
    use ndarray::IxDyn;

    fn observations(setup: &RunSetup, lanes: usize) -> ObsDict {
        setup
            .observation_space
            .keys()
            .map(|key| {
                let mut shape = vec![lanes];
                shape.extend(setup.observation_space.key_shape(key).unwrap());
                (key.clone(), ArrayD::from_elem(IxDyn(&shape), 0.25))
            })
            .collect()
    }

    #[test]
    fn test_act_emits_one_hot_actions() {
        let setup = tiny_setup(false);
        let mut player = DreamerPlayer::new(&setup).unwrap();
        let actions = player.act(&observations(&setup, 3), 0.0).unwrap();
        assert_eq!(actions.shape(), &[3, 2]);
        for row in actions.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        assert_eq!(player.num_lanes(), 3);
    }

    #[test]
    fn test_act_with_pixels() {
        let setup = tiny_pixel_setup();
        let mut player = DreamerPlayer::new(&setup).unwrap().with_greedy(true);
        let actions = player.act(&observations(&setup, 2), 0.0).unwrap();
        assert_eq!(actions.shape(), &[2, 2]);
    }

    #[test]
    fn test_continuous_exploration_stays_in_bounds() {
        let setup = tiny_setup(true);
        let mut player = DreamerPlayer::new(&setup).unwrap();
        let actions = player.act(&observations(&setup, 4), 5.0).unwrap();
        assert!(actions.iter().all(|a| (-1.0..=1.0).contains(a)));
    }

    #[test]
    fn test_reset_lane_discards_its_state() {
        let setup = tiny_setup(false);
        let mut player = DreamerPlayer::new(&setup).unwrap();
        let obs = observations(&setup, 2);
        player.reset_lanes(&[0, 1]).unwrap();
        player.act(&obs, 0.0).unwrap();
        let fresh = player.recurrent_state().get(0).copy();
        player.act(&obs, 0.0).unwrap();
        player.reset_lanes(&[0]).unwrap();
        player.act(&obs, 0.0).unwrap();
        // With the previous state masked the recurrent update is deterministic
        let diff = (player.recurrent_state().get(0) - fresh).abs().max().double_value(&[]);
        assert!(diff < 1e-6, "{diff}");
    }

    #[test]
    fn test_loads_learner_parameters() {
        let setup = tiny_setup(false);
        let learner = DreamerLearner::new(&setup, 1).unwrap();
        let mut player = DreamerPlayer::new(&setup).unwrap();
        let params = learner.player_parameters().unwrap();
        player.load_parameters(&params).unwrap();

        let err = player.load_parameters(&params[1..]).unwrap_err();
        assert!(matches!(err, DreamError::ShapeMismatch { .. }));
    }
}
