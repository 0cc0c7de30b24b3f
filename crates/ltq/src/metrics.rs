//! Prometheus counters and histograms for task execution, mirroring the
//! metrics module of this codebase's other task-queue crate. `Task::send`
//! and `Worker::process_message` call these recorders directly (behind this
//! feature flag); nothing reads them back, so disabling the feature changes
//! nothing about delivery semantics.

#![cfg(feature = "metrics")]

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder};

pub struct TaskMetrics {
    pub tasks_published: CounterVec,
    pub tasks_executed: CounterVec,
    pub task_duration_seconds: HistogramVec,
    pub tasks_retried: CounterVec,
    pub tasks_rejected: CounterVec,
    pub tasks_failed: CounterVec,
}

impl TaskMetrics {
    fn new() -> Self {
        Self {
            tasks_published: register_counter_vec!(
                "ltq_tasks_published_total",
                "Number of Messages published",
                &["task_name"]
            )
            .expect("metric registers"),
            tasks_executed: register_counter_vec!(
                "ltq_tasks_executed_total",
                "Number of Messages that completed successfully",
                &["task_name"]
            )
            .expect("metric registers"),
            task_duration_seconds: register_histogram_vec!(
                "ltq_task_duration_seconds",
                "Task body execution time",
                &["task_name"]
            )
            .expect("metric registers"),
            tasks_retried: register_counter_vec!(
                "ltq_tasks_retried_total",
                "Number of retry signals observed",
                &["task_name"]
            )
            .expect("metric registers"),
            tasks_rejected: register_counter_vec!(
                "ltq_tasks_rejected_total",
                "Number of reject signals observed",
                &["task_name"]
            )
            .expect("metric registers"),
            tasks_failed: register_counter_vec!(
                "ltq_tasks_failed_total",
                "Number of unhandled errors observed",
                &["task_name"]
            )
            .expect("metric registers"),
        }
    }

    pub fn record_published(&self, task_name: &str) {
        self.tasks_published.with_label_values(&[task_name]).inc();
    }

    pub fn record_executed(&self, task_name: &str, duration_secs: f64) {
        self.tasks_executed.with_label_values(&[task_name]).inc();
        self.task_duration_seconds.with_label_values(&[task_name]).observe(duration_secs);
    }

    pub fn record_retried(&self, task_name: &str) {
        self.tasks_retried.with_label_values(&[task_name]).inc();
    }

    pub fn record_rejected(&self, task_name: &str) {
        self.tasks_rejected.with_label_values(&[task_name]).inc();
    }

    pub fn record_failed(&self, task_name: &str) {
        self.tasks_failed.with_label_values(&[task_name]).inc();
    }
}

pub static METRICS: Lazy<TaskMetrics> = Lazy::new(TaskMetrics::new);

/// Renders the process's metrics in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}
