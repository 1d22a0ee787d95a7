//! Console logging backend.

use super::{MetricLogger, Metrics};
use std::collections::BTreeMap;

/// Prints metrics through `tracing`, one line per `Section/` prefix.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }

    fn group(metrics: &Metrics) -> BTreeMap<&str, Vec<(&str, f64)>> {
        let mut groups: BTreeMap<&str, Vec<(&str, f64)>> = BTreeMap::new();
        for (name, &value) in metrics {
            let (section, short) = name.split_once('/').unwrap_or(("", name.as_str()));
            groups.entry(section).or_default().push((short, value));
        }
        groups
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Step {}: {} = {:.4}", step, name, value);
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) {
        for (section, values) in Self::group(metrics) {
            let line = values
                .iter()
                .map(|(k, v)| format!("{k}={v:.4}"))
                .collect::<Vec<_>>()
                .join(", ");
            if section.is_empty() {
                tracing::info!("Step {}: {}", step, line);
            } else {
                tracing::info!("Step {} [{}]: {}", step, section, line);
            }
        }
    }
}
