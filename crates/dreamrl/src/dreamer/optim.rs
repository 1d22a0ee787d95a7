//! Adam with checkpointable moments, gradient averaging and clipping.

use super::params::{tensor_to_vec, vec_to_tensor};
use crate::comm::CommunicationGroup;
use crate::metrics::MetricsContext;
use crate::{DreamError, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};
use tracing::warn;

pub const NON_FINITE_METRIC: &str = "Grads/non_finite";

/// Serialized Adam moments, in variable order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdamState {
    pub step: u64,
    pub exp_avg: Vec<Vec<f32>>,
    pub exp_avg_sq: Vec<Vec<f32>>,
}

/// Adam over the trainable variables of one `VarStore`.
pub struct Adam {
    variables: Vec<Tensor>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: u64,
}

impl Adam {
    pub fn new(vs: &nn::VarStore, lr: f64, eps: f64) -> Self {
        let variables = vs.trainable_variables();
        let exp_avg = variables.iter().map(Tensor::zeros_like).collect();
        let exp_avg_sq = variables.iter().map(Tensor::zeros_like).collect();
        Self {
            variables,
            exp_avg,
            exp_avg_sq,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps,
            step: 0,
        }
    }

    pub fn variables(&self) -> &[Tensor] {
        &self.variables
    }

    pub fn zero_grad(&mut self) {
        for var in &mut self.variables {
            var.zero_grad();
        }
    }

    pub fn step(&mut self) {
        self.step += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let bias1 = 1.0 - b1.powi(self.step as i32);
        let bias2 = 1.0 - b2.powi(self.step as i32);
        let lr = self.lr;
        let eps = self.eps;
        tch::no_grad(|| {
            for ((var, m), v) in self
                .variables
                .iter_mut()
                .zip(self.exp_avg.iter_mut())
                .zip(self.exp_avg_sq.iter_mut())
            {
                let grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                let next_m = &*m * b1 + &grad * (1.0 - b1);
                let next_v = &*v * b2 + grad.pow_tensor_scalar(2.0) * (1.0 - b2);
                m.copy_(&next_m);
                v.copy_(&next_v);
                let update = (next_m / bias1) / ((next_v / bias2).sqrt() + eps) * lr;
                let next = &*var - update;
                var.copy_(&next);
            }
        });
    }

    /// Replace every gradient by its mean over `group`.
    ///
    /// Missing gradients count as zeros so all ranks exchange the same
    /// layout.
    pub fn all_reduce_gradients(&mut self, group: &dyn CommunicationGroup) -> Result<()> {
        if group.world_size() < 2 {
            return Ok(());
        }
        let mut flat = Vec::new();
        for var in &self.variables {
            let grad = var.grad();
            if grad.defined() {
                flat.extend(tensor_to_vec(&grad)?);
            } else {
                flat.extend(std::iter::repeat(0.0).take(var.numel()));
            }
        }
        group.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for var in &self.variables {
            let n = var.numel();
            let mut grad = var.grad();
            if grad.defined() {
                let mean = vec_to_tensor(&flat[offset..offset + n], &var.size(), var.device())?;
                tch::no_grad(|| grad.copy_(&mean));
            }
            offset += n;
        }
        Ok(())
    }

    /// Global gradient norm.
    pub fn grad_norm(&self) -> f64 {
        self.variables
            .iter()
            .map(|v| v.grad())
            .filter(|g| g.defined())
            .map(|g| g.pow_tensor_scalar(2.0).sum(tch::Kind::Float).double_value(&[]))
            .sum::<f64>()
            .sqrt()
    }

    /// Scale gradients so their global norm is at most `max_norm` and
    /// return the norm before clipping.
    ///
    /// A non-finite norm is an error when `strict`; otherwise it is logged,
    /// counted under `Grads/non_finite` and the gradients are left as is.
    pub fn clip_grad_norm(
        &mut self,
        max_norm: f64,
        strict: bool,
        metrics: &mut MetricsContext,
    ) -> Result<f64> {
        let norm = self.grad_norm();
        if !norm.is_finite() {
            if strict {
                return Err(DreamError::NonFiniteGradient { norm });
            }
            warn!(norm, "Non-finite gradient norm, skipping clip");
            metrics.update(NON_FINITE_METRIC, 1.0);
            return Ok(norm);
        }
        if norm > max_norm {
            let clip_coef = max_norm / (norm + 1e-6);
            for var in &self.variables {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.f_mul_scalar_(clip_coef);
                }
            }
        }
        Ok(norm)
    }

    pub fn state(&self) -> Result<AdamState> {
        Ok(AdamState {
            step: self.step,
            exp_avg: self.exp_avg.iter().map(tensor_to_vec).collect::<Result<_>>()?,
            exp_avg_sq: self.exp_avg_sq.iter().map(tensor_to_vec).collect::<Result<_>>()?,
        })
    }

    pub fn load_state(&mut self, state: &AdamState) -> Result<()> {
        if state.exp_avg.len() != self.variables.len() || state.exp_avg_sq.len() != self.variables.len() {
            return Err(DreamError::Serialization(format!(
                "optimizer state holds {} tensors, expected {}",
                state.exp_avg.len(),
                self.variables.len()
            )));
        }
        for (i, var) in self.variables.iter().enumerate() {
            let (size, device) = (var.size(), var.device());
            let m = vec_to_tensor(&state.exp_avg[i], &size, device)?;
            let v = vec_to_tensor(&state.exp_avg_sq[i], &size, device)?;
            tch::no_grad(|| {
                self.exp_avg[i].copy_(&m);
                self.exp_avg_sq[i].copy_(&v);
            });
        }
        self.step = state.step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn quadratic() -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[3], nn::Init::Const(2.0));
        (vs, w)
    }

    #[test]
    fn test_adam_descends() {
        let (vs, w) = quadratic();
        let mut opt = Adam::new(&vs, 0.1, 1e-8);
        let before = w.pow_tensor_scalar(2.0).sum(Kind::Float).double_value(&[]);
        for _ in 0..10 {
            opt.zero_grad();
            w.pow_tensor_scalar(2.0).sum(Kind::Float).backward();
            opt.step();
        }
        let after = w.pow_tensor_scalar(2.0).sum(Kind::Float).double_value(&[]);
        assert!(after < before, "{after} >= {before}");
        assert_eq!(opt.state().unwrap().step, 10);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let (vs, w) = quadratic();
        let mut opt = Adam::new(&vs, 0.1, 1e-8);
        // grad = 2w = [4, 4, 4], norm = sqrt(48)
        w.pow_tensor_scalar(2.0).sum(Kind::Float).backward();
        let mut metrics = MetricsContext::new(true);
        let norm = opt.clip_grad_norm(1.0, false, &mut metrics).unwrap();
        assert!((norm - 48f64.sqrt()).abs() < 1e-4);
        assert!((opt.grad_norm() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_non_finite_norm() {
        let (vs, w) = quadratic();
        let mut opt = Adam::new(&vs, 0.1, 1e-8);
        (w.sum(Kind::Float) * f64::NAN).backward();
        let mut metrics = MetricsContext::new(true);
        let norm = opt.clip_grad_norm(1.0, false, &mut metrics).unwrap();
        assert!(norm.is_nan());
        assert_eq!(metrics.compute().get(NON_FINITE_METRIC), Some(&1.0));

        let err = opt.clip_grad_norm(1.0, true, &mut metrics).unwrap_err();
        assert!(matches!(err, DreamError::NonFiniteGradient { .. }));
    }

    #[test]
    fn test_state_roundtrip() {
        let (vs, w) = quadratic();
        let mut opt = Adam::new(&vs, 0.1, 1e-8);
        w.pow_tensor_scalar(2.0).sum(Kind::Float).backward();
        opt.step();
        let state = opt.state().unwrap();

        let (other_vs, _) = quadratic();
        let mut other = Adam::new(&other_vs, 0.1, 1e-8);
        other.load_state(&state).unwrap();
        let restored = other.state().unwrap();
        assert_eq!(restored.step, 1);
        assert_eq!(restored.exp_avg, state.exp_avg);
        assert_eq!(restored.exp_avg_sq, state.exp_avg_sq);
    }
}
