//! LTQ is a distributed task queue: pluggable brokers, a bounded-concurrency
//! worker pool, a middleware pipeline, a cron scheduler, and an App that
//! supervises several workers in one process.
//!
//! ```no_run
//! use ltq::{broker, Worker, WorkerConfig, TaskOptions};
//! use serde_json::Value;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = broker::from_url("memory://").await?;
//! let worker = Worker::new("emails", broker, WorkerConfig::default());
//! let send_email = worker.register("send_email", TaskOptions::new(), |_args: Value, _kwargs: Value| async move {
//!     Ok(ltq::Outcome::Success)
//! });
//! send_email.send(Value::Null, Value::Null).await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod broker;
pub mod error;
pub mod message;
pub mod middleware;
pub mod task;
pub mod worker;

#[cfg(feature = "scheduler")]
pub mod scheduler;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "tracing-otel")]
pub mod tracing_support;

#[cfg(feature = "schema")]
pub mod schema;

pub use app::App;
pub use broker::{from_url, Broker};
pub use error::LtqError;
pub use message::Message;
pub use middleware::{default_stack, Middleware};
pub use task::{Outcome, Task, TaskFn, TaskId, TaskOptions, TaskRegistry};
pub use worker::{Worker, WorkerConfig};

#[cfg(feature = "scheduler")]
pub use scheduler::Scheduler;
