//! Recurrent state-space model: deterministic GRU path plus categorical
//! stochastic codes.

use super::config::DreamerConfig;
use super::distributions::OneHotCategorical;
use tch::{nn, Kind, Tensor};

/// GRU cell with a single fused projection followed by LayerNorm.
///
/// The update gate is biased by `-1` so new cells start out mostly
/// copying their previous state.
#[derive(Debug)]
pub struct LayerNormGruCell {
    linear: nn::Linear,
    norm: nn::LayerNorm,
}

impl LayerNormGruCell {
    pub fn new(p: &nn::Path, input_size: i64, hidden_size: i64) -> Self {
        Self {
            linear: nn::linear(
                p / "linear",
                input_size + hidden_size,
                3 * hidden_size,
                nn::LinearConfig {
                    bias: false,
                    ..Default::default()
                },
            ),
            norm: nn::layer_norm(p / "norm", vec![3 * hidden_size], Default::default()),
        }
    }

    pub fn forward(&self, input: &Tensor, state: &Tensor) -> Tensor {
        let parts = Tensor::cat(&[input, state], -1)
            .apply(&self.linear)
            .apply(&self.norm)
            .chunk(3, -1);
        let reset = parts[0].sigmoid();
        let candidate = (reset * &parts[1]).tanh();
        let update = (&parts[2] - 1.0).sigmoid();
        &update * candidate + (1.0 - update) * state
    }
}

/// `{recurrent [.., R], stochastic [.., S, D]}`.
#[derive(Debug)]
pub struct LatentState {
    pub recurrent: Tensor,
    pub stochastic: Tensor,
}

impl Clone for LatentState {
    fn clone(&self) -> Self {
        Self {
            recurrent: self.recurrent.shallow_clone(),
            stochastic: self.stochastic.shallow_clone(),
        }
    }
}

impl LatentState {
    pub fn zeros(config: &DreamerConfig, batch_size: i64, device: tch::Device) -> Self {
        Self {
            recurrent: Tensor::zeros([batch_size, config.recurrent_state_size], (Kind::Float, device)),
            stochastic: Tensor::zeros(
                [batch_size, config.stochastic_size, config.discrete_size],
                (Kind::Float, device),
            ),
        }
    }

    /// `[stochastic (flattened), recurrent]`, the input of every head.
    pub fn features(&self) -> Tensor {
        Tensor::cat(&[self.stochastic.flatten(-2, -1), self.recurrent.shallow_clone()], -1)
    }
}

/// Result of one posterior step.
#[derive(Debug)]
pub struct PosteriorStep {
    pub recurrent: Tensor,
    pub posterior: Tensor,
    pub prior: Tensor,
    /// Normalized (unimixed) log-probabilities `[B, S, D]`
    pub posterior_logits: Tensor,
    pub prior_logits: Tensor,
}

pub struct Rssm {
    input: nn::Sequential,
    cell: LayerNormGruCell,
    transition: nn::Sequential,
    representation: nn::Sequential,
    stochastic_size: i64,
    discrete_size: i64,
    unimix: f64,
}

fn logits_head(p: &nn::Path, in_dim: i64, units: i64, out_dim: i64) -> nn::Sequential {
    nn::seq()
        .add(nn::linear(
            p / "hidden",
            in_dim,
            units,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        ))
        .add(nn::layer_norm(p / "norm", vec![units], Default::default()))
        .add_fn(|xs| xs.silu())
        .add(nn::linear(p / "logits", units, out_dim, Default::default()))
}

impl Rssm {
    pub fn new(p: &nn::Path, config: &DreamerConfig, embedding_size: i64) -> Self {
        let units = config.dense_units;
        let recurrent = config.recurrent_state_size;
        let stoch_flat = config.stochastic_flat();

        let input = nn::seq()
            .add(nn::linear(
                p / "input",
                stoch_flat + config.action_size(),
                units,
                nn::LinearConfig {
                    bias: false,
                    ..Default::default()
                },
            ))
            .add(nn::layer_norm(p / "input_norm", vec![units], Default::default()))
            .add_fn(|xs| xs.silu());

        Self {
            input,
            cell: LayerNormGruCell::new(&(p / "cell"), units, recurrent),
            transition: logits_head(&(p / "transition"), recurrent, units, stoch_flat),
            representation: logits_head(
                &(p / "representation"),
                recurrent + embedding_size,
                units,
                stoch_flat,
            ),
            stochastic_size: config.stochastic_size,
            discrete_size: config.discrete_size,
            unimix: config.world_model.unimix,
        }
    }

    fn recurrent_step(&self, stochastic: &Tensor, recurrent: &Tensor, action: &Tensor) -> Tensor {
        let x = Tensor::cat(&[stochastic.flatten(-2, -1), action.shallow_clone()], -1).apply(&self.input);
        self.cell.forward(&x, recurrent)
    }

    /// Unimixed logits and a straight-through one-hot sample.
    fn stochastic_state(&self, raw: &Tensor) -> (Tensor, Tensor) {
        let mut shape = raw.size();
        shape.pop();
        shape.extend([self.stochastic_size, self.discrete_size]);
        let dist = OneHotCategorical::new(&raw.reshape(shape.as_slice()), self.unimix);
        (dist.logits().shallow_clone(), dist.rsample())
    }

    /// Prior logits and sample from a recurrent state alone.
    pub fn transition(&self, recurrent: &Tensor) -> (Tensor, Tensor) {
        self.stochastic_state(&recurrent.apply(&self.transition))
    }

    /// Posterior logits and sample from a recurrent state and an embedding.
    pub fn representation(&self, recurrent: &Tensor, embedded: &Tensor) -> (Tensor, Tensor) {
        let x = Tensor::cat(&[recurrent, embedded], -1);
        self.stochastic_state(&x.apply(&self.representation))
    }

    /// One step with a real observation.
    ///
    /// Shapes: `posterior [B, S, D]`, `recurrent [B, R]`, `action [B, A]`,
    /// `embedded [B, E]`, `is_first [B, 1]`. Where `is_first` is set the
    /// previous state and action are zeroed before the update.
    pub fn dynamic(
        &self,
        posterior: &Tensor,
        recurrent: &Tensor,
        action: &Tensor,
        embedded: &Tensor,
        is_first: &Tensor,
    ) -> PosteriorStep {
        let keep = 1.0 - is_first;
        let action = action * &keep;
        let prev_recurrent = recurrent * &keep;
        let prev_posterior = posterior * keep.unsqueeze(-1);

        let recurrent = self.recurrent_step(&prev_posterior, &prev_recurrent, &action);
        let (prior_logits, prior) = self.transition(&recurrent);
        let (posterior_logits, posterior) = self.representation(&recurrent, embedded);
        PosteriorStep {
            recurrent,
            posterior,
            prior,
            posterior_logits,
            prior_logits,
        }
    }

    /// One step in latent space: returns `(prior, recurrent)`.
    pub fn imagination(&self, prior: &Tensor, recurrent: &Tensor, action: &Tensor) -> (Tensor, Tensor) {
        let recurrent = self.recurrent_step(prior, recurrent, action);
        let (_, prior) = self.transition(&recurrent);
        (prior, recurrent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dreamer::tests::tiny_config;
    use tch::Device;

    fn opts() -> (Kind, Device) {
        (Kind::Float, Device::Cpu)
    }

    fn build(config: &DreamerConfig) -> (nn::VarStore, Rssm) {
        let vs = nn::VarStore::new(Device::Cpu);
        let rssm = Rssm::new(&(&vs.root() / "rssm"), config, 8);
        (vs, rssm)
    }

    #[test]
    fn test_dynamic_shapes() {
        let config = tiny_config(false);
        let (_vs, rssm) = build(&config);
        let state = LatentState::zeros(&config, 3, Device::Cpu);
        let step = rssm.dynamic(
            &state.stochastic,
            &state.recurrent,
            &Tensor::zeros([3, config.action_size()], opts()),
            &Tensor::randn([3, 8], opts()),
            &Tensor::ones([3, 1], opts()),
        );
        assert_eq!(step.recurrent.size(), vec![3, 16]);
        assert_eq!(step.posterior.size(), vec![3, 4, 4]);
        assert_eq!(step.prior.size(), vec![3, 4, 4]);
        assert_eq!(step.prior_logits.size(), vec![3, 4, 4]);

        let features = LatentState {
            recurrent: step.recurrent,
            stochastic: step.posterior,
        }
        .features();
        assert_eq!(features.size(), vec![3, config.latent_size()]);
    }

    #[test]
    fn test_is_first_discards_previous_state() {
        let config = tiny_config(false);
        let (_vs, rssm) = build(&config);
        let embedded = Tensor::randn([2, 8], opts());
        let is_first = Tensor::ones([2, 1], opts());
        let action = Tensor::ones([2, config.action_size()], opts());

        let a = rssm.dynamic(
            &Tensor::ones([2, 4, 4], opts()),
            &Tensor::randn([2, 16], opts()),
            &action,
            &embedded,
            &is_first,
        );
        let b = rssm.dynamic(
            &Tensor::zeros([2, 4, 4], opts()),
            &Tensor::zeros([2, 16], opts()),
            &Tensor::zeros([2, config.action_size()], opts()),
            &embedded,
            &is_first,
        );
        let diff = (a.recurrent - b.recurrent).abs().max().double_value(&[]);
        assert_eq!(diff, 0.0);
        let diff = (a.posterior_logits - b.posterior_logits).abs().max().double_value(&[]);
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_imagination_uses_prior() {
        let config = tiny_config(true);
        let (_vs, rssm) = build(&config);
        let state = LatentState::zeros(&config, 5, Device::Cpu);
        let (prior, recurrent) = rssm.imagination(
            &state.stochastic,
            &state.recurrent,
            &Tensor::zeros([5, config.action_size()], opts()),
        );
        assert_eq!(prior.size(), vec![5, 4, 4]);
        assert_eq!(recurrent.size(), vec![5, 16]);
        let groups = prior.sum(Kind::Float).double_value(&[]);
        assert!((groups - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_gru_update_gate_starts_closed() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = LayerNormGruCell::new(&vs.root(), 4, 6);
        for (_, mut var) in vs.variables() {
            tch::no_grad(|| {
                let _ = var.zero_();
            });
        }
        let state = Tensor::ones([1, 6], opts());
        let next = cell.forward(&Tensor::zeros([1, 4], opts()), &state);
        // Zero pre-activations: candidate 0, update sigmoid(-1)
        let expected = 1.0 - 1.0 / (1.0 + 1f64.exp());
        let err = (next - expected).abs().max().double_value(&[]);
        assert!(err < 1e-6, "{err}");
    }
}
