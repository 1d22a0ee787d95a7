//! Distributions over latent codes and actions.

use tch::{Kind, Tensor};

const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// `sign(x) * ln(|x| + 1)`
pub fn symlog(x: &Tensor) -> Tensor {
    x.sign() * (x.abs() + 1.0).log()
}

/// Inverse of [`symlog`].
pub fn symexp(x: &Tensor) -> Tensor {
    x.sign() * (x.abs().exp() - 1.0)
}

/// Sum over the trailing `dims` dimensions.
pub(crate) fn sum_last(x: &Tensor, dims: usize) -> Tensor {
    if dims == 0 {
        return x.shallow_clone();
    }
    let axes: Vec<i64> = (-(dims as i64)..0).collect();
    x.sum_dim_intlist(axes.as_slice(), false, Kind::Float)
}

/// Categorical over the last dimension with one-hot samples.
///
/// Probabilities are mixed with a uniform distribution before anything else
/// touches them, so sampling, entropy and KL all see the mixed version.
#[derive(Debug)]
pub struct OneHotCategorical {
    /// Normalized log-probabilities
    logits: Tensor,
    probs: Tensor,
}

impl OneHotCategorical {
    pub fn new(logits: &Tensor, unimix: f64) -> Self {
        if unimix > 0.0 {
            let classes = *logits.size().last().unwrap_or(&1) as f64;
            let probs = logits.softmax(-1, Kind::Float) * (1.0 - unimix) + unimix / classes;
            Self {
                logits: probs.log(),
                probs,
            }
        } else {
            let logits = logits.log_softmax(-1, Kind::Float);
            Self {
                probs: logits.exp(),
                logits,
            }
        }
    }

    pub fn logits(&self) -> &Tensor {
        &self.logits
    }

    pub fn probs(&self) -> &Tensor {
        &self.probs
    }

    fn classes(&self) -> i64 {
        *self.probs.size().last().unwrap_or(&1)
    }

    fn straight_through(&self, hard: Tensor) -> Tensor {
        hard + &self.probs - self.probs.detach()
    }

    /// One-hot sample whose gradient is the gradient of the probabilities.
    pub fn rsample(&self) -> Tensor {
        let classes = self.classes();
        let hard = self
            .probs
            .detach()
            .reshape([-1, classes])
            .multinomial(1, true)
            .squeeze_dim(-1)
            .one_hot(classes)
            .to_kind(Kind::Float)
            .reshape(self.probs.size());
        self.straight_through(hard)
    }

    /// One-hot argmax, straight-through like [`Self::rsample`].
    pub fn mode(&self) -> Tensor {
        let hard = self
            .probs
            .argmax(-1, false)
            .one_hot(self.classes())
            .to_kind(Kind::Float);
        self.straight_through(hard)
    }

    pub fn log_prob(&self, one_hot: &Tensor) -> Tensor {
        (one_hot * &self.logits).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
    }

    pub fn entropy(&self) -> Tensor {
        -(&self.probs * &self.logits).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float)
    }
}

/// `KL(p || q)` between categoricals given as normalized log-probabilities,
/// summed over the trailing `event_dims` dimensions.
pub fn kl_categorical(p_logits: &Tensor, q_logits: &Tensor, event_dims: usize) -> Tensor {
    sum_last(&(p_logits.exp() * (p_logits - q_logits)), event_dims)
}

/// Gaussian whose samples are clamped to `[-1, 1]` with a straight-through
/// gradient. Used by continuous actors.
#[derive(Debug)]
pub struct ClampedNormal {
    mean: Tensor,
    std: Tensor,
}

impl ClampedNormal {
    pub fn new(mean: Tensor, std: Tensor) -> Self {
        Self { mean, std }
    }

    pub fn rsample(&self) -> Tensor {
        let x = &self.mean + &self.std * Tensor::randn_like(&self.mean);
        let clamped = x.clamp(-1.0, 1.0);
        &x + (clamped - &x).detach()
    }

    pub fn mode(&self) -> Tensor {
        self.mean.clamp(-1.0, 1.0)
    }

    /// Summed over the action dimension.
    pub fn log_prob(&self, x: &Tensor) -> Tensor {
        let z = (x - &self.mean) / &self.std;
        let per_dim = z.pow_tensor_scalar(2.0) * -0.5 - self.std.log() - 0.5 * LOG_2PI;
        sum_last(&per_dim, 1)
    }

    pub fn entropy(&self) -> Tensor {
        sum_last(&(self.std.log() + 0.5 * (1.0 + LOG_2PI)), 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn randn(shape: &[i64]) -> Tensor {
        Tensor::randn(shape, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_one_hot_sums_to_groups() {
        let dist = OneHotCategorical::new(&randn(&[4, 3, 5]), 0.01);
        let sample = dist.rsample();
        assert_eq!(sample.size(), vec![4, 3, 5]);
        let per_group = sample.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
        let err = (per_group - 1.0).abs().max().double_value(&[]);
        assert!(err < 1e-5, "{err}");
        let total = sample.sum(Kind::Float).double_value(&[]);
        assert!((total - 12.0).abs() < 1e-4);
    }

    #[test]
    fn test_straight_through_gradient() {
        let logits = randn(&[2, 3, 4]).set_requires_grad(true);
        let dist = OneHotCategorical::new(&logits, 0.01);
        let weights = Tensor::arange(4, (Kind::Float, Device::Cpu));
        let loss = (dist.rsample() * weights).sum(Kind::Float);
        loss.backward();
        let grad = logits.grad().abs().sum(Kind::Float).double_value(&[]);
        assert!(grad > 0.0);
    }

    #[test]
    fn test_unimix_floor() {
        let logits = Tensor::from_slice(&[100.0f32, 0.0, 0.0, 0.0]).reshape([1, 4]);
        let dist = OneHotCategorical::new(&logits, 0.01);
        let min = dist.probs().min().double_value(&[]);
        assert!((min - 0.0025).abs() < 1e-6, "{min}");
    }

    #[test]
    fn test_kl_of_identical_is_zero() {
        let dist = OneHotCategorical::new(&randn(&[5, 3, 4]), 0.01);
        let kl = kl_categorical(dist.logits(), dist.logits(), 2);
        assert_eq!(kl.size(), vec![5]);
        assert!(kl.abs().max().double_value(&[]) < 1e-6);

        let other = OneHotCategorical::new(&randn(&[5, 3, 4]), 0.01);
        let kl = kl_categorical(dist.logits(), other.logits(), 2);
        assert!(kl.min().double_value(&[]) >= -1e-6);
    }

    #[test]
    fn test_clamped_normal_stays_in_bounds() {
        let opts = (Kind::Float, Device::Cpu);
        let dist = ClampedNormal::new(Tensor::zeros([64, 2], opts), Tensor::ones([64, 2], opts) * 3.0);
        let sample = dist.rsample();
        assert!(sample.abs().max().double_value(&[]) <= 1.0);
        assert_eq!(dist.log_prob(&sample).size(), vec![64]);
    }

    #[test]
    fn test_symlog_inverse() {
        let x = Tensor::from_slice(&[-100.0f32, -1.0, 0.0, 0.5, 1000.0]);
        let err = (symexp(&symlog(&x)) - &x).abs().max().double_value(&[]);
        assert!(err < 1e-2, "{err}");
    }
}
