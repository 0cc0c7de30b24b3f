//! Task identity, options, and the registry a Worker consults to dispatch
//! incoming Messages to a callable.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::Broker;
use crate::error::LtqError;
use crate::message::Message;

/// Opaque identifier for a Message, stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn from_string(s: &str) -> Result<Self, LtqError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| LtqError::Configuration(format!("invalid task id: {e}")))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened while a task body ran.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Completed without error; broker should `ack`.
    Success,
    /// Retry signal with an explicit delay; broker should `nack(delay, drop=false)`.
    Retry { delay: Duration },
    /// Reject signal; broker should `nack(drop=true)` and a warning is logged.
    Reject { reason: String },
    /// Unhandled error from the body or a middleware; broker should
    /// `nack(drop=true)` and an error is logged. Carries the display form of
    /// the error since the original type is erased at this boundary.
    Error(String),
}

/// Per-task configuration, immutable after declaration.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct TaskOptions {
    /// Maximum number of executions before MaxTries rejects. `None` = unlimited.
    pub max_tries: Option<u32>,
    /// Maximum age a Message may have when entering the body. `None` = unlimited.
    pub max_age: Option<Duration>,
    /// Rate limit string of the form `"N/u"`, `u` in `{s, m, h}`.
    pub max_rate: Option<String>,
    /// Explicit queue name overriding `{worker_name}:{function_name}`.
    pub queue: Option<String>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_tries(mut self, n: u32) -> Self {
        self.max_tries = Some(n);
        self
    }

    pub fn max_age(mut self, d: Duration) -> Self {
        self.max_age = Some(d);
        self
    }

    pub fn max_rate(mut self, rate: impl Into<String>) -> Self {
        self.max_rate = Some(rate.into());
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }
}

/// The callable a Task dispatches to. Implemented directly for closures via
/// the blanket impl below, so `worker.register("name", opts, |args, kwargs| async move { .. })`
/// works without naming a type.
#[async_trait]
pub trait TaskFn: Send + Sync + 'static {
    async fn call(&self, args: Value, kwargs: Value) -> anyhow::Result<Outcome>;
}

#[async_trait]
impl<F, Fut> TaskFn for F
where
    F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    async fn call(&self, args: Value, kwargs: Value) -> anyhow::Result<Outcome> {
        (self)(args, kwargs).await
    }
}

/// A binding of (function, options, queue) owned by exactly one Worker.
pub struct Task {
    task_name: String,
    queue: String,
    options: TaskOptions,
    func: Arc<dyn TaskFn>,
    broker: Arc<dyn Broker>,
}

impl Task {
    pub(crate) fn new(
        task_name: String,
        queue: String,
        options: TaskOptions,
        func: Arc<dyn TaskFn>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self { task_name, queue, options, func, broker }
    }

    pub fn name(&self) -> &str {
        &self.task_name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub(crate) fn func(&self) -> &Arc<dyn TaskFn> {
        &self.func
    }

    /// Build a Message but do not publish it.
    pub fn message(&self, args: Value, kwargs: Value) -> Message {
        Message::new(self.task_name.clone(), args, kwargs)
    }

    /// Build a Message and publish it to this task's queue with zero delay.
    pub async fn send(&self, args: Value, kwargs: Value) -> Result<(), LtqError> {
        let message = self.message(args, kwargs);
        self.broker.publish(&self.queue, message, Duration::ZERO).await?;
        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_published(&self.task_name);
        Ok(())
    }

    /// Like `send`, but with an explicit delay before the Message becomes visible.
    pub async fn send_delayed(&self, args: Value, kwargs: Value, delay: Duration) -> Result<(), LtqError> {
        let message = self.message(args, kwargs);
        self.broker.publish(&self.queue, message, delay).await?;
        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_published(&self.task_name);
        Ok(())
    }
}

/// Maps `task_name → Task` for a single Worker.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { tasks: DashMap::new() }
    }

    pub fn register(&self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        self.tasks.insert(task.name().to_string(), task.clone());
        task
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<Task>> {
        self.tasks.get(task_name).map(|t| t.clone())
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queue names of every registered task, deduplicated.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .tasks
            .iter()
            .map(|entry| entry.value().queue().to_string())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    fn test_broker() -> Arc<dyn Broker> {
        Arc::new(MemoryBroker::new())
    }

    #[test]
    fn task_id_round_trips() {
        let id = TaskId::new();
        let parsed = TaskId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[tokio::test]
    async fn registry_register_and_get() {
        let registry = TaskRegistry::new();
        let task = Task::new(
            "emails:send_email".into(),
            "emails:send_email".into(),
            TaskOptions::new(),
            Arc::new(|_args: Value, _kwargs: Value| async move { Ok(Outcome::Success) }),
            test_broker(),
        );
        registry.register(task);
        assert!(registry.contains("emails:send_email"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("emails:send_email").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn send_publishes_to_queue() {
        let broker = test_broker();
        let task = Task::new(
            "emails:send_email".into(),
            "emails:send_email".into(),
            TaskOptions::new(),
            Arc::new(|_args: Value, _kwargs: Value| async move { Ok(Outcome::Success) }),
            broker.clone(),
        );
        task.send(serde_json::json!(["a"]), serde_json::json!({})).await.unwrap();
        assert_eq!(broker.size("emails:send_email").await.unwrap(), 1);
    }
}
