//! World model and actor networks.

use super::config::DreamerConfig;
use super::distributions::{ClampedNormal, OneHotCategorical};
use super::models::{DenseHead, ObservationDecoder, ObservationEncoder};
use super::registry::ModelRegistry;
use super::rssm::Rssm;
use crate::Result;
use tch::{nn, Kind, Tensor};

/// Top-level module names of the world model's `VarStore`.
pub const ENCODER: &str = "encoder";
pub const DECODER: &str = "decoder";
pub const RSSM: &str = "rssm";
pub const REWARD: &str = "reward";
pub const CONTINUE: &str = "continue";

/// Modules the player needs to act.
pub const PLAYER_MODULES: [&str; 2] = [ENCODER, RSSM];

pub struct WorldModel {
    pub encoder: Box<dyn ObservationEncoder>,
    pub decoder: Box<dyn ObservationDecoder>,
    pub rssm: Rssm,
    pub reward: DenseHead,
    pub continue_head: DenseHead,
}

impl WorldModel {
    pub fn new(p: &nn::Path, config: &DreamerConfig, registry: &ModelRegistry, architecture: &str) -> Result<Self> {
        let models = registry.build(architecture, p, config)?;
        let latent = config.latent_size();
        let embedding = models.encoder.output_dim();
        Ok(Self {
            rssm: Rssm::new(&(p / RSSM), config, embedding),
            reward: DenseHead::new(&(p / REWARD), latent, 1, config.mlp_layers, config.dense_units),
            continue_head: DenseHead::new(&(p / CONTINUE), latent, 1, config.mlp_layers, config.dense_units),
            encoder: models.encoder,
            decoder: models.decoder,
        })
    }
}

/// Policy over encoded actions given latent features.
pub enum ActionDistribution {
    Continuous(ClampedNormal),
    /// One categorical per discrete action dimension
    Discrete(Vec<OneHotCategorical>),
}

impl ActionDistribution {
    pub fn log_prob(&self, actions: &Tensor, actions_dim: &[i64]) -> Tensor {
        match self {
            ActionDistribution::Continuous(dist) => dist.log_prob(actions),
            ActionDistribution::Discrete(dists) => {
                let parts = actions.split_with_sizes(actions_dim, -1);
                dists
                    .iter()
                    .zip(&parts)
                    .map(|(d, a)| d.log_prob(a))
                    .reduce(|a, b| a + b)
                    .unwrap_or_else(|| actions.zeros_like().sum_dim_intlist([-1i64].as_slice(), false, Kind::Float))
            }
        }
    }

    pub fn entropy(&self) -> Tensor {
        match self {
            ActionDistribution::Continuous(dist) => dist.entropy(),
            ActionDistribution::Discrete(dists) => dists
                .iter()
                .map(OneHotCategorical::entropy)
                .reduce(|a, b| a + b)
                .unwrap_or_else(|| Tensor::from(0.0f32)),
        }
    }
}

const INIT_STD: f64 = 2.0;
const MIN_STD: f64 = 0.1;
const MAX_STD: f64 = 1.0;

#[derive(Debug)]
pub struct Actor {
    body: nn::Sequential,
    heads: Vec<nn::Linear>,
    actions_dim: Vec<i64>,
    is_continuous: bool,
    unimix: f64,
}

impl Actor {
    pub fn new(p: &nn::Path, config: &DreamerConfig) -> Self {
        let units = config.dense_units;
        let mut body = nn::seq();
        let mut cur_in = config.latent_size();
        for i in 0..config.mlp_layers.max(1) {
            body = body
                .add(nn::linear(
                    p / format!("l{i}"),
                    cur_in,
                    units,
                    nn::LinearConfig {
                        bias: false,
                        ..Default::default()
                    },
                ))
                .add(nn::layer_norm(p / format!("n{i}"), vec![units], Default::default()))
                .add_fn(|xs| xs.silu());
            cur_in = units;
        }
        let heads = if config.is_continuous {
            vec![nn::linear(p / "head", units, 2 * config.action_size(), Default::default())]
        } else {
            config
                .actions_dim
                .iter()
                .enumerate()
                .map(|(i, &n)| nn::linear(p / format!("head{i}"), units, n, Default::default()))
                .collect()
        };
        Self {
            body,
            heads,
            actions_dim: config.actions_dim.clone(),
            is_continuous: config.is_continuous,
            unimix: config.world_model.unimix,
        }
    }

    pub fn actions_dim(&self) -> &[i64] {
        &self.actions_dim
    }

    pub fn distribution(&self, latent: &Tensor) -> ActionDistribution {
        let h = latent.apply(&self.body);
        if self.is_continuous {
            let out = h.apply(&self.heads[0]).chunk(2, -1);
            let mean = out[0].tanh();
            let std = (out[1].shallow_clone() + INIT_STD).sigmoid() * (MAX_STD - MIN_STD) + MIN_STD;
            ActionDistribution::Continuous(ClampedNormal::new(mean, std))
        } else {
            ActionDistribution::Discrete(
                self.heads
                    .iter()
                    .map(|head| OneHotCategorical::new(&h.apply(head), self.unimix))
                    .collect(),
            )
        }
    }

    /// Encoded actions `[.., action_size]` and the distribution they came
    /// from. Samples are differentiable; `greedy` takes the mode instead.
    pub fn forward(&self, latent: &Tensor, greedy: bool) -> (Tensor, ActionDistribution) {
        let dist = self.distribution(latent);
        let actions = match &dist {
            ActionDistribution::Continuous(d) if greedy => d.mode(),
            ActionDistribution::Continuous(d) => d.rsample(),
            ActionDistribution::Discrete(ds) => {
                let parts: Vec<Tensor> = ds
                    .iter()
                    .map(|d| if greedy { d.mode() } else { d.rsample() })
                    .collect();
                Tensor::cat(&parts, -1)
            }
        };
        (actions, dist)
    }
}

/// Exploration noise on encoded actions `[N, A]`: Gaussian noise for
/// continuous actions, a uniformly random one-hot per discrete head with
/// probability `amount`.
pub fn add_exploration_noise(actions: &Tensor, amount: f64, actions_dim: &[i64], is_continuous: bool) -> Tensor {
    if amount <= 0.0 {
        return actions.shallow_clone();
    }
    if is_continuous {
        return (actions + Tensor::randn_like(actions) * amount).clamp(-1.0, 1.0);
    }
    let parts: Vec<Tensor> = actions
        .split_with_sizes(actions_dim, -1)
        .iter()
        .map(|part| {
            let n = *part.size().last().unwrap_or(&1);
            let leading = part.size()[..part.dim() - 1].to_vec();
            let random = Tensor::randint(n, leading.as_slice(), (Kind::Int64, part.device()))
                .one_hot(n)
                .to_kind(Kind::Float);
            let mut mask_shape = leading;
            mask_shape.push(1);
            let explore = Tensor::rand(mask_shape.as_slice(), (Kind::Float, part.device())).lt(amount);
            random.where_self(&explore, part)
        })
        .collect();
    Tensor::cat(&parts, -1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dreamer::tests::tiny_config;
    use tch::Device;

    #[test]
    fn test_discrete_actor_emits_one_hot() {
        let config = tiny_config(false);
        let vs = nn::VarStore::new(Device::Cpu);
        let actor = Actor::new(&vs.root(), &config);
        let latent = Tensor::randn([6, config.latent_size()], (Kind::Float, Device::Cpu));
        let (actions, dist) = actor.forward(&latent, false);
        assert_eq!(actions.size(), vec![6, config.action_size()]);
        let rows = actions.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
        assert!((rows - 1.0).abs().max().double_value(&[]) < 1e-5);
        assert_eq!(dist.log_prob(&actions, actor.actions_dim()).size(), vec![6]);
        assert_eq!(dist.entropy().size(), vec![6]);
    }

    #[test]
    fn test_continuous_actor_is_bounded() {
        let config = tiny_config(true);
        let vs = nn::VarStore::new(Device::Cpu);
        let actor = Actor::new(&vs.root(), &config);
        let latent = Tensor::randn([6, config.latent_size()], (Kind::Float, Device::Cpu)) * 10.0;
        let (actions, _) = actor.forward(&latent, false);
        assert_eq!(actions.size(), vec![6, 2]);
        assert!(actions.abs().max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn test_full_exploration_replaces_actions() {
        let actions = Tensor::zeros([5, 3], (Kind::Float, Device::Cpu));
        let noisy = add_exploration_noise(&actions, 1.0, &[3], false);
        // Every row becomes a valid one-hot
        let rows = noisy.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
        assert!((rows - 1.0).abs().max().double_value(&[]) < 1e-6);

        let untouched = add_exploration_noise(&actions, 0.0, &[3], false);
        assert_eq!(untouched.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }
}
