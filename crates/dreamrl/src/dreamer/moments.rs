//! Percentile-based return normalization.

use crate::comm::CommunicationGroup;
use crate::config::MomentsConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

/// Exponential moving averages of the low and high percentiles of the
/// λ-returns, shared by every learner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    decay: f64,
    /// Returns are never scaled up by more than `max`
    max: f64,
    percentile_low: f64,
    percentile_high: f64,
    low: f64,
    high: f64,
}

/// Linear-interpolated quantile of sorted values.
fn quantile(sorted: &[f32], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] as f64 * (1.0 - frac) + sorted[hi] as f64 * frac
        }
    }
}

impl Moments {
    pub fn new(config: &MomentsConfig) -> Self {
        Self {
            decay: config.decay,
            max: config.max,
            percentile_low: config.percentile.low,
            percentile_high: config.percentile.high,
            low: 0.0,
            high: 0.0,
        }
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    /// Fold in new percentiles and return `(offset, inverse_scale)`.
    pub fn observe(&mut self, low: f64, high: f64) -> (f64, f64) {
        self.low = self.decay * self.low + (1.0 - self.decay) * low;
        self.high = self.decay * self.high + (1.0 - self.decay) * high;
        let invscale = (self.high - self.low).max(1.0 / self.max);
        (self.low, invscale)
    }

    /// Update from a batch of returns. Percentiles are averaged across
    /// `group` so every learner normalizes identically.
    pub fn update(&mut self, values: &Tensor, group: &dyn CommunicationGroup) -> Result<(f64, f64)> {
        let flat = values.detach().to_device(Device::Cpu).to_kind(Kind::Float).flatten(0, -1);
        let mut data = Vec::<f32>::try_from(flat)?;
        data.sort_by(|a, b| a.total_cmp(b));
        let mut percentiles = [
            quantile(&data, self.percentile_low) as f32,
            quantile(&data, self.percentile_high) as f32,
        ];
        if group.world_size() > 1 {
            group.all_reduce_mean(&mut percentiles)?;
        }
        Ok(self.observe(percentiles[0] as f64, percentiles[1] as f64))
    }
}
