use crate::comm::RunSetup;
use crate::config::{ActorConfig, CriticConfig, WorldModelConfig};
use crate::spaces::DynSpace;
use crate::{DreamError, Result};

/// Network dimensions resolved from a run configuration and the
/// environment spaces.
#[derive(Clone, Debug)]
pub struct DreamerConfig {
    /// Number of categorical variables in the stochastic state.
    pub stochastic_size: i64,
    /// Classes per categorical variable.
    pub discrete_size: i64,
    /// GRU hidden size.
    pub recurrent_state_size: i64,

    pub dense_units: i64,
    pub mlp_layers: usize,
    pub cnn_multiplier: i64,

    /// Image encoder keys with their `[C, H, W]` shape.
    pub cnn_encoder: Vec<(String, [i64; 3])>,
    /// Vector encoder keys with their flat size.
    pub mlp_encoder: Vec<(String, i64)>,
    pub cnn_decoder: Vec<String>,
    pub mlp_decoder: Vec<String>,

    /// One entry per action head.
    pub actions_dim: Vec<i64>,
    pub is_continuous: bool,

    /// Imagination horizon.
    pub horizon: usize,
    pub gamma: f64,
    pub lmbda: f64,

    pub world_model: WorldModelConfig,
    pub actor: ActorConfig,
    pub critic: CriticConfig,
    pub strict_gradients: bool,
    pub seed: u64,
}

impl DreamerConfig {
    pub fn from_setup(setup: &RunSetup) -> Result<Self> {
        let config = &setup.config;
        let algo = &config.algo;
        let obs = &setup.observation_space;

        let mut cnn_encoder = Vec::new();
        for key in &algo.cnn_keys.encoder {
            let shape = obs.key_shape(key)?;
            let [c, h, w] = shape[..] else {
                return Err(DreamError::ShapeMismatch {
                    key: key.clone(),
                    expected: vec![0, 0, 0],
                    actual: shape,
                });
            };
            if h != w || h < 8 || !h.is_power_of_two() {
                return Err(DreamError::Configuration(format!(
                    "image key '{key}' must be square with a power-of-two side >= 8, got {h}x{w}"
                )));
            }
            cnn_encoder.push((key.clone(), [c as i64, h as i64, w as i64]));
        }
        if let Some((_, first)) = cnn_encoder.first() {
            if let Some((key, _)) = cnn_encoder.iter().find(|(_, s)| s[1..] != first[1..]) {
                return Err(DreamError::Configuration(format!(
                    "image key '{key}' does not share the resolution of the other image keys"
                )));
            }
        }

        let mlp_encoder = algo
            .mlp_keys
            .encoder
            .iter()
            .map(|key| {
                let size: usize = obs.key_shape(key)?.iter().product();
                Ok((key.clone(), size as i64))
            })
            .collect::<Result<Vec<_>>>()?;

        let actions_dim: Vec<i64> = setup
            .action_space
            .actions_dim()
            .into_iter()
            .map(|n| n as i64)
            .collect();
        if actions_dim.is_empty() {
            return Err(DreamError::Configuration(
                "dict action spaces are not supported".into(),
            ));
        }

        let wm = &algo.world_model;
        Ok(Self {
            stochastic_size: wm.stochastic_size as i64,
            discrete_size: wm.discrete_size as i64,
            recurrent_state_size: wm.recurrent_state_size as i64,
            dense_units: algo.dense_units as i64,
            mlp_layers: algo.mlp_layers,
            cnn_multiplier: algo.cnn_multiplier as i64,
            cnn_encoder,
            mlp_encoder,
            cnn_decoder: algo.cnn_keys.decoder.clone(),
            mlp_decoder: algo.mlp_keys.decoder.clone(),
            actions_dim,
            is_continuous: matches!(setup.action_space, DynSpace::Box(_)),
            horizon: algo.horizon,
            gamma: algo.gamma,
            lmbda: algo.lmbda,
            world_model: wm.clone(),
            actor: algo.actor.clone(),
            critic: algo.critic.clone(),
            strict_gradients: config.strict_gradients,
            seed: config.seed,
        })
    }

    /// Flattened size of a stochastic state.
    pub fn stochastic_flat(&self) -> i64 {
        self.stochastic_size * self.discrete_size
    }

    /// Size of `[stochastic, recurrent]` features fed to every head.
    pub fn latent_size(&self) -> i64 {
        self.stochastic_flat() + self.recurrent_state_size
    }

    /// Width of an encoded action.
    pub fn action_size(&self) -> i64 {
        self.actions_dim.iter().sum()
    }
}
