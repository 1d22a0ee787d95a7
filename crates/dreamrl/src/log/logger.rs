//! Metric logger traits and composites.

use std::collections::BTreeMap;

/// Metric name to value, ordered by name.
pub type Metrics = BTreeMap<String, f64>;

/// Trait for logging metrics to various backends.
pub trait MetricLogger: Send + Sync {
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log every metric of one step.
    fn log_metrics(&self, metrics: &Metrics, step: u64);

    /// Flush pending writes.
    fn close(&self) {}
}

/// Discards everything. Used on ranks that do not own a sink.
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &Metrics, _step: u64) {}
}

/// Dispatches to multiple backends.
#[derive(Default)]
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}
