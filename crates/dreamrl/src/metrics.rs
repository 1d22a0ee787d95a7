//! Metric aggregation and timing.
//!
//! Both objects are switched on or off once, when they are built. A
//! disabled context accepts updates and returns nothing, so call sites never
//! branch on the logging configuration.

use crate::log::Metrics;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Running mean per metric name.
#[derive(Debug, Clone)]
pub struct MetricsContext {
    enabled: bool,
    sums: BTreeMap<String, (f64, u64)>,
}

impl MetricsContext {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sums: BTreeMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record one observation. Non-finite values are dropped.
    pub fn update(&mut self, name: &str, value: f64) {
        if !self.enabled || !value.is_finite() {
            return;
        }
        let entry = self.sums.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    pub fn update_all(&mut self, metrics: &Metrics) {
        for (name, &value) in metrics {
            self.update(name, value);
        }
    }

    /// Mean of every metric seen since the last reset.
    pub fn compute(&self) -> Metrics {
        self.sums
            .iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(k, (sum, n))| (k.clone(), sum / *n as f64))
            .collect()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
    }
}

impl Default for MetricsContext {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Accumulated wall time per named section.
#[derive(Debug, Clone)]
pub struct Timers {
    enabled: bool,
    totals: BTreeMap<String, Duration>,
}

impl Timers {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            totals: BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `f`, adding its duration to `name`.
    pub fn measure<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        if !self.enabled {
            return f();
        }
        let start = Instant::now();
        let out = f();
        self.record(name, start.elapsed());
        out
    }

    pub fn record(&mut self, name: &str, elapsed: Duration) {
        if self.enabled {
            *self.totals.entry(name.to_string()).or_default() += elapsed;
        }
    }

    /// Seconds spent in `name` since the last reset.
    pub fn seconds(&self, name: &str) -> f64 {
        self.totals.get(name).map(Duration::as_secs_f64).unwrap_or(0.0)
    }

    pub fn compute(&self) -> Metrics {
        self.totals
            .iter()
            .map(|(k, d)| (k.clone(), d.as_secs_f64()))
            .collect()
    }

    pub fn reset(&mut self) {
        self.totals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_aggregation() {
        let mut ctx = MetricsContext::new(true);
        ctx.update("Loss/value_loss", 1.0);
        ctx.update("Loss/value_loss", 3.0);
        ctx.update("Loss/value_loss", f64::NAN);
        assert_eq!(ctx.compute()["Loss/value_loss"], 2.0);
        ctx.reset();
        assert!(ctx.compute().is_empty());
    }

    #[test]
    fn test_disabled_context_is_silent() {
        let mut ctx = MetricsContext::disabled();
        ctx.update("Rewards/rew_avg", 5.0);
        assert!(ctx.compute().is_empty());

        let mut timers = Timers::new(false);
        assert_eq!(timers.measure("Time/env_interaction_time", || 7), 7);
        assert!(timers.compute().is_empty());
    }

    #[test]
    fn test_timers_accumulate() {
        let mut timers = Timers::new(true);
        timers.record("Time/train_time", Duration::from_millis(250));
        timers.record("Time/train_time", Duration::from_millis(250));
        assert!((timers.seconds("Time/train_time") - 0.5).abs() < 1e-9);
        assert_eq!(timers.seconds("missing"), 0.0);
    }
}
