//! TensorBoard event files under `<run_dir>/tensorboard`.

use super::{MetricLogger, Metrics};
use std::path::Path;
use std::sync::Mutex;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Section for metric names without a `Section/` prefix.
const DEFAULT_SECTION: &str = "Misc";

/// Scalar tag for a metric. Names are already `Section/name`; bare names are
/// filed under [`DEFAULT_SECTION`] so every chart lands in a group.
fn scalar_tag(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("{DEFAULT_SECTION}/{name}")
    }
}

/// Writes the player's metrics as TensorBoard scalars, keyed by policy step.
pub struct TensorBoardLogger {
    writer: Mutex<SummaryWriter>,
}

impl TensorBoardLogger {
    /// Event files go to `<run_dir>/tensorboard`, next to the checkpoints.
    pub fn for_run(run_dir: impl AsRef<Path>) -> Self {
        let log_dir = run_dir.as_ref().join("tensorboard");
        Self {
            writer: Mutex::new(SummaryWriter::new(&log_dir)),
        }
    }

    fn write<'a>(&self, scalars: impl Iterator<Item = (&'a str, f64)>, step: u64) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        // NaN placeholders (no finished episode yet) are not plotted
        for (name, value) in scalars.filter(|(_, v)| v.is_finite()) {
            writer.add_scalar(&scalar_tag(name), value as f32, step as usize);
        }
        let _ = writer.flush();
    }
}

impl MetricLogger for TensorBoardLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        self.write(std::iter::once((name, value)), step);
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) {
        self.write(metrics.iter().map(|(k, v)| (k.as_str(), *v)), step);
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}
