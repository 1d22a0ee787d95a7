//! JSON-lines logging backend.

use super::{MetricLogger, Metrics};
use crate::Result;
use serde_json::{json, Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Appends `{"step": .., "<metric>": ..}` objects, one per line.
pub struct JsonlLogger {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlLogger {
    /// Open (or create) `path` in append mode, so a resumed run extends
    /// the same file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, record: Value) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writeln!(writer, "{record}") {
                tracing::warn!("failed to write metrics: {}", e);
            }
        }
    }
}

impl MetricLogger for JsonlLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        let mut record = Map::new();
        record.insert("step".into(), json!(step));
        record.insert(name.to_string(), json!(value));
        self.write_line(Value::Object(record));
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) {
        let mut record = Map::new();
        record.insert("step".into(), json!(step));
        for (name, value) in metrics {
            // NaN is not representable in JSON
            let v = if value.is_finite() { json!(value) } else { Value::Null };
            record.insert(name.clone(), v);
        }
        self.write_line(Value::Object(record));
        self.close();
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}
