//! Dreamer-style world-model agent.
//!
//! A recurrent state-space model ([`Rssm`]) learns latent dynamics from
//! replayed sequences; an actor and a critic are trained purely on
//! trajectories imagined inside that model. [`DreamerLearner`] and
//! [`DreamerPlayer`] plug the agent into the coordinator.

mod agent;
mod config;
mod distributions;
mod loss;
mod models;
mod moments;
mod optim;
mod params;
mod player;
mod registry;
mod rssm;
mod trainer;

pub use agent::{add_exploration_noise, ActionDistribution, Actor, WorldModel, PLAYER_MODULES};
pub use config::DreamerConfig;
pub use distributions::{kl_categorical, symexp, symlog, ClampedNormal, OneHotCategorical};
pub use loss::{lambda_values, WorldModelLoss};
pub use models::{
    DenseHead, MultiDecoder, MultiEncoder, ObservationDecoder, ObservationEncoder, TensorDict,
};
pub use moments::Moments;
pub use optim::{Adam, AdamState, NON_FINITE_METRIC};
pub use params::{
    array_to_tensor, flatten_parameters, load_flat_parameters, parameter_count, soft_update,
    tensor_to_array, StoreSnapshot,
};
pub use player::DreamerPlayer;
pub use registry::{ModelFactory, ModelRegistry, ObservationModels};
pub use rssm::{LatentState, LayerNormGruCell, PosteriorStep, Rssm};
pub use trainer::{DreamerLearner, DreamerTrainer};

#[cfg(test)]
pub(crate) mod tests {
    use super::DreamerConfig;
    use crate::buffer::{SequenceBatch, ACTIONS, DONES, IS_FIRST, REWARDS};
    use crate::comm::{LocalGroup, LocalHub, RunSetup};
    use crate::config::{KeySet, RunConfig};
    use crate::spaces::{Box as BoxSpace, Dict, Discrete, DynSpace};
    use ndarray::{ArrayD, IxDyn};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(crate) fn tiny_setup(continuous: bool) -> RunSetup {
        let action_space = if continuous {
            DynSpace::Box(BoxSpace::symmetric(&[2]))
        } else {
            DynSpace::Discrete(Discrete::new(2))
        };
        RunSetup {
            config: RunConfig::default().tiny(),
            observation_space: Dict::from_pairs(vec![(
                "state",
                DynSpace::Box(BoxSpace::uniform(&[3], -1.0, 1.0)),
            )]),
            action_space,
        }
    }

    pub(crate) fn tiny_pixel_setup() -> RunSetup {
        let mut config = RunConfig::default().tiny();
        config.env.screen_size = 16;
        config.algo.cnn_keys = KeySet {
            encoder: vec!["rgb".into()],
            decoder: vec!["rgb".into()],
        };
        RunSetup {
            config,
            observation_space: Dict::from_pairs(vec![
                ("rgb", DynSpace::Box(BoxSpace::image(3, 16, 16))),
                ("state", DynSpace::Box(BoxSpace::uniform(&[3], -1.0, 1.0))),
            ]),
            action_space: DynSpace::Discrete(Discrete::new(2)),
        }
    }

    pub(crate) fn tiny_config(continuous: bool) -> DreamerConfig {
        DreamerConfig::from_setup(&tiny_setup(continuous)).unwrap()
    }

    pub(crate) fn tiny_pixel_config() -> DreamerConfig {
        DreamerConfig::from_setup(&tiny_pixel_setup()).unwrap()
    }

    /// Group of one rank; collectives return immediately.
    pub(crate) fn solo_group() -> LocalGroup {
        LocalHub::new(1, Duration::from_secs(5))
            .world_groups()
            .remove(0)
    }

    /// Random `[T, B, ...]` batch matching `setup`, with `is_first` on the
    /// first step only.
    pub(crate) fn random_batch(setup: &RunSetup, seq_len: usize, batch_size: usize) -> SequenceBatch {
        let mut fields = BTreeMap::new();
        for key in setup.observation_space.keys() {
            let Ok(shape) = setup.observation_space.key_shape(key) else {
                continue;
            };
            let mut full = vec![seq_len, batch_size];
            full.extend(shape);
            let n: usize = full.iter().product();
            let data = (0..n).map(|i| ((i * 37) % 255) as f32 / 255.0).collect();
            fields.insert(key.clone(), ArrayD::from_shape_vec(IxDyn(&full), data).unwrap());
        }
        let action_dim = setup.action_space.encoded_dim();
        let mut actions = ArrayD::zeros(IxDyn(&[seq_len, batch_size, action_dim]));
        for t in 0..seq_len {
            for b in 0..batch_size {
                actions[[t, b, (t + b) % action_dim]] = 1.0;
            }
        }
        fields.insert(ACTIONS.to_string(), actions);
        let column = |value: f32| ArrayD::from_elem(IxDyn(&[seq_len, batch_size, 1]), value);
        fields.insert(REWARDS.to_string(), column(0.5));
        fields.insert(DONES.to_string(), column(0.0));
        fields.insert(IS_FIRST.to_string(), column(0.0));
        let mut batch = SequenceBatch::new(fields).unwrap();
        batch.prepare().unwrap();
        batch
    }
}
