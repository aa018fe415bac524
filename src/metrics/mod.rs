//! Metrics module for Prometheus-based monitoring.
//!
//! Covers task outcomes, processing duration, retries, queue depth per status
//! and active workers.
//!
//! # Example
//!
//! ```ignore
//! use loganalysis::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.update_queue_depth(&stats);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, QUEUE_DEPTH, REGISTRY, TASKS_TOTAL, TASK_DURATION, TASK_RETRIES,
};
