//! World-model losses and return estimation.

use super::distributions::{kl_categorical, sum_last, symlog};
use crate::config::WorldModelConfig;
use tch::{Kind, Tensor};

/// Scalar world-model loss and its parts (each a batch mean).
#[derive(Debug)]
pub struct WorldModelLoss {
    pub total: Tensor,
    /// Unbalanced `KL(post || prior)`
    pub kl: Tensor,
    /// Balanced, floored and weighted KL term
    pub state_loss: Tensor,
    pub observation_loss: Tensor,
    pub reward_loss: Tensor,
    pub continue_loss: Tensor,
}

/// Log-likelihood of `target` under a unit Gaussian around `prediction`
/// (up to a constant), summed over `event_dims`.
pub fn mse_log_prob(prediction: &Tensor, target: &Tensor, event_dims: usize) -> Tensor {
    -sum_last(&(prediction - target).pow_tensor_scalar(2.0), event_dims)
}

/// Like [`mse_log_prob`] with the target squashed by symlog first.
pub fn symlog_mse_log_prob(prediction: &Tensor, target: &Tensor, event_dims: usize) -> Tensor {
    mse_log_prob(prediction, &symlog(target), event_dims)
}

/// Bernoulli log-likelihood from logits, summed over the last dimension.
pub fn bernoulli_log_prob(logits: &Tensor, target: &Tensor) -> Tensor {
    let ll = target * logits.log_sigmoid() + (1.0 - target) * (-logits).log_sigmoid();
    sum_last(&ll, 1)
}

/// KL balancing with free nats.
///
/// Returns `(kl, state_loss)` per element: the dynamics term trains the
/// prior toward a frozen posterior, the representation term the posterior
/// toward a frozen prior. Each is floored at `free_nats` before weighting.
pub fn kl_balanced(
    posterior_logits: &Tensor,
    prior_logits: &Tensor,
    config: &WorldModelConfig,
) -> (Tensor, Tensor) {
    let dynamic = kl_categorical(&posterior_logits.detach(), prior_logits, 2);
    let representation = kl_categorical(posterior_logits, &prior_logits.detach(), 2);
    let kl = dynamic.detach();
    let state_loss = dynamic.clamp_min(config.kl_free_nats) * config.kl_dynamic
        + representation.clamp_min(config.kl_free_nats) * config.kl_representation;
    (kl, state_loss)
}

/// Combine per-element log-likelihoods `[T, B]` and latent logits
/// `[T, B, S, D]` into the world-model objective.
pub fn reconstruction_loss(
    observation_log_prob: &Tensor,
    reward_log_prob: &Tensor,
    continue_log_prob: &Tensor,
    posterior_logits: &Tensor,
    prior_logits: &Tensor,
    config: &WorldModelConfig,
) -> WorldModelLoss {
    let (kl, state_loss) = kl_balanced(posterior_logits, prior_logits, config);
    let observation_loss = -observation_log_prob;
    let reward_loss = -reward_log_prob;
    let continue_loss = -continue_log_prob * config.continue_scale_factor;
    let total = (&state_loss * config.kl_regularizer + &observation_loss + &reward_loss + &continue_loss)
        .mean(Kind::Float);
    WorldModelLoss {
        total,
        kl: kl.mean(Kind::Float),
        state_loss: state_loss.mean(Kind::Float),
        observation_loss: observation_loss.mean(Kind::Float),
        reward_loss: reward_loss.mean(Kind::Float),
        continue_loss: continue_loss.mean(Kind::Float),
    }
}

/// λ-returns over an imagined horizon, computed backwards.
///
/// `rewards`, `values` and `continues` are `[H, ...]` and already aligned
/// to the steps after the start state; `continues` carries the discount.
/// The last value bootstraps the recursion.
pub fn lambda_values(rewards: &Tensor, values: &Tensor, continues: &Tensor, lmbda: f64) -> Tensor {
    let horizon = rewards.size()[0];
    let interm = rewards + continues * values * (1.0 - lmbda);
    let mut next = values.get(horizon - 1);
    let mut returns = Vec::with_capacity(horizon as usize);
    for t in (0..horizon).rev() {
        next = interm.get(t) + continues.get(t) * lmbda * &next;
        returns.push(next.shallow_clone());
    }
    returns.reverse();
    Tensor::stack(&returns, 0)
}
