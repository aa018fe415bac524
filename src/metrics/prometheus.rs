//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the queue service and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks that reached an outcome, labeled by status and task type.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task processing duration in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Retries scheduled, labeled by task type.
pub static TASK_RETRIES: OnceLock<CounterVec> = OnceLock::new();

/// Number of tasks per status as reported by the store.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently processing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Should be called once at startup. Recording before this call is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new(
            "loganalysis_tasks_total",
            "Total number of tasks that reached an outcome",
        ),
        &["status", "type"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "loganalysis_task_duration_seconds",
            "Task processing duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 600.0]),
        &["type"],
    )?;

    let task_retries = CounterVec::new(
        Opts::new("loganalysis_task_retries_total", "Total retries scheduled"),
        &["type"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("loganalysis_queue_depth", "Number of tasks per status"),
        &["status"],
    )?;

    let active_workers = Gauge::new(
        "loganalysis_active_workers",
        "Number of workers currently processing a task",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(task_retries.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASK_RETRIES.set(task_retries);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
