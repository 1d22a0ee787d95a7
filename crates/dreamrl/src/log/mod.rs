//! Metric sinks.
//!
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` groups metrics by their `Section/name` prefix
//! - `JsonlLogger` appends one JSON object per logging step
//! - `TensorBoardLogger` for visualization (optional)
//! - `CompositeLogger` fans out to several backends

mod console;
mod jsonl;
mod logger;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use console::ConsoleLogger;
pub use jsonl::JsonlLogger;
pub use logger::{CompositeLogger, MetricLogger, Metrics, NoOpLogger};
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardLogger;
