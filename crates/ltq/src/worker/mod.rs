//! The Worker: bounded-concurrency consumption loop, middleware pipeline,
//! and outcome-to-broker-operation translation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::error::LtqError;
use crate::message::Message;
use crate::middleware::{self, Middleware};
use crate::task::{Outcome, Task, TaskFn, TaskId, TaskOptions, TaskRegistry};

/// Tunables that do not change the delivery contract, only its pacing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of Messages processed concurrently by this Worker.
    pub concurrency: usize,
    /// How long shutdown waits for in-flight processing before force-nacking.
    pub drain_timeout: Duration,
    /// `older_than` passed to `recover` at startup.
    pub recover_grace: Duration,
    /// Upper bound on how long a single `consume` call may block.
    pub consume_block: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            drain_timeout: Duration::from_secs(30),
            recover_grace: Duration::from_secs(5 * 60),
            consume_block: Duration::from_secs(2),
        }
    }
}

struct InFlightEntry {
    queue: String,
    message: Message,
}

/// Consumes from the queues of its registered tasks, enforces a concurrency
/// limit, drives the middleware pipeline, and translates outcomes into
/// `ack`/`nack` calls.
pub struct Worker {
    name: String,
    worker_id: String,
    broker: Arc<dyn Broker>,
    registry: TaskRegistry,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    in_flight: DashMap<TaskId, InFlightEntry>,
}

impl Worker {
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>, config: WorkerConfig) -> Arc<Self> {
        let name = name.into();
        let worker_id = format!("{name}-{}", uuid::Uuid::now_v7().simple());
        Arc::new(Self {
            name,
            worker_id,
            broker,
            registry: TaskRegistry::new(),
            middlewares: RwLock::new(middleware::default_stack()),
            config,
            shutdown: CancellationToken::new(),
            in_flight: DashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Registers a task whose queue is `{worker_name}:{name}` unless
    /// `options.queue` overrides it.
    pub fn register(&self, name: &str, options: TaskOptions, func: impl TaskFn) -> Arc<Task> {
        let task_name = format!("{}:{name}", self.name);
        let queue = options.queue.clone().unwrap_or_else(|| task_name.clone());
        let task = Task::new(task_name, queue, options, Arc::new(func), self.broker.clone());
        self.registry.register(task)
    }

    /// Replaces the default `[MaxTries, MaxAge, MaxRate]` stack. Must be
    /// called before `start`.
    pub async fn set_middleware(&self, middlewares: Vec<Arc<dyn Middleware>>) {
        *self.middlewares.write().await = middlewares;
    }

    /// Prepends `prefix` as outer layers, used by [`crate::app::App`] to
    /// apply its own middleware stack ahead of the Worker's.
    pub async fn prepend_middleware(&self, prefix: Vec<Arc<dyn Middleware>>) {
        let mut guard = self.middlewares.write().await;
        let mut combined = prefix;
        combined.append(&mut guard);
        *guard = combined;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs `recover(queue, older_than=recover_grace)` for every registered
    /// queue, logging and continuing past broker errors.
    pub async fn recover_all(&self) {
        for queue in self.registry.queues() {
            match self.broker.recover(&queue, self.config.recover_grace).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(queue = %queue, reclaimed = n, "recovered in-flight messages from a prior run"),
                Err(err) => tracing::warn!(queue = %queue, error = %err, "recover failed at startup"),
            }
        }
    }

    /// Registers all tasks, runs startup recovery, then blocks running the
    /// per-queue consumption fibers until `shutdown()` is called and
    /// in-flight processing drains (or the drain deadline elapses).
    pub async fn start(self: Arc<Self>) -> Result<(), LtqError> {
        self.recover_all().await;

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let processing = Arc::new(tokio::sync::Mutex::new(JoinSet::new()));

        let mut fibers = Vec::new();
        for queue in self.registry.queues() {
            let worker = self.clone();
            let semaphore = semaphore.clone();
            let processing = processing.clone();
            fibers.push(tokio::spawn(async move {
                worker.consumption_fiber(queue, semaphore, processing).await;
            }));
        }

        self.shutdown.cancelled().await;
        tracing::info!(worker = %self.name, "shutdown requested, draining in-flight messages");

        for fiber in fibers {
            let _ = fiber.await;
        }

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            let mut guard = processing.lock().await;
            while guard.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                worker = %self.name,
                "drain deadline elapsed with messages still in flight; nacking for redelivery"
            );
            let stuck: Vec<(TaskId, String, Message)> = self
                .in_flight
                .iter()
                .map(|entry| (*entry.key(), entry.value().queue.clone(), entry.value().message.clone()))
                .collect();
            for (id, queue, message) in stuck {
                if self.in_flight.remove(&id).is_some() {
                    if let Err(err) = self.broker.nack(&queue, &self.worker_id, &message, Duration::ZERO, false).await {
                        tracing::error!(error = %err, "nack at shutdown failed");
                    }
                }
            }
            processing.lock().await.abort_all();
        }

        Ok(())
    }

    async fn consumption_fiber(
        self: Arc<Self>,
        queue: String,
        semaphore: Arc<Semaphore>,
        processing: Arc<tokio::sync::Mutex<JoinSet<()>>>,
    ) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let Ok(first_permit) = semaphore.clone().acquire_owned().await else { return };
            let mut permits = vec![first_permit];
            while let Ok(permit) = semaphore.clone().try_acquire_owned() {
                permits.push(permit);
            }
            let count = permits.len();

            match self.broker.consume(&queue, &self.worker_id, count, self.config.consume_block).await {
                Ok(messages) => {
                    let consumed = messages.len();
                    for (message, permit) in messages.into_iter().zip(permits.drain(..consumed)) {
                        self.in_flight.insert(
                            message.id,
                            InFlightEntry { queue: queue.clone(), message: message.clone() },
                        );
                        let worker = self.clone();
                        let queue = queue.clone();
                        processing.lock().await.spawn(async move {
                            let _permit = permit;
                            worker.process_message(queue, message).await;
                        });
                    }
                    // Unused permits (fewer messages than requested) drop here, releasing capacity.
                }
                Err(err) => {
                    tracing::warn!(queue = %queue, error = %err, "consume failed, retrying after backoff");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn process_message(self: Arc<Self>, queue: String, mut message: Message) {
        let task_name = message.task_name.clone();
        let Some(task) = self.registry.get(&task_name) else {
            let err = LtqError::TaskNotFound(task_name.clone());
            tracing::error!(error = %err, "dropping message for unroutable task");
            self.in_flight.remove(&message.id);
            if let Err(err) = self.broker.nack(&queue, &self.worker_id, &message, Duration::ZERO, true).await {
                tracing::error!(error = %err, "nack failed for unroutable message");
            }
            return;
        };

        let middlewares = self.middlewares.read().await.clone();
        #[cfg(feature = "metrics")]
        let started_at = std::time::Instant::now();
        let outcome = middleware::run_pipeline(&middlewares, &mut message, &task).await;

        // Atomically hand off responsibility for this message: if the drain
        // path already claimed it (shutdown deadline elapsed), don't also
        // finalize it here.
        if self.in_flight.remove(&message.id).is_none() {
            return;
        }

        match outcome {
            Outcome::Success => {
                #[cfg(feature = "metrics")]
                crate::metrics::METRICS.record_executed(&task_name, started_at.elapsed().as_secs_f64());
                if let Err(err) = self.broker.ack(&queue, &self.worker_id, &message).await {
                    tracing::error!(error = %err, task_name = %task_name, "ack failed");
                }
            }
            Outcome::Retry { delay } => {
                #[cfg(feature = "metrics")]
                crate::metrics::METRICS.record_retried(&task_name);
                if let Err(err) = self.broker.nack(&queue, &self.worker_id, &message, delay, false).await {
                    tracing::error!(error = %err, task_name = %task_name, "nack(retry) failed");
                }
            }
            Outcome::Reject { reason } => {
                tracing::warn!(task_name = %task_name, reason = %reason, "task rejected");
                #[cfg(feature = "metrics")]
                crate::metrics::METRICS.record_rejected(&task_name);
                if let Err(err) = self.broker.nack(&queue, &self.worker_id, &message, Duration::ZERO, true).await {
                    tracing::error!(error = %err, task_name = %task_name, "nack(reject) failed");
                }
            }
            Outcome::Error(err) => {
                tracing::error!(task_name = %task_name, error = %err, "task failed with an unhandled error");
                #[cfg(feature = "metrics")]
                crate::metrics::METRICS.record_failed(&task_name);
                if let Err(err) = self.broker.nack(&queue, &self.worker_id, &message, Duration::ZERO, true).await {
                    tracing::error!(error = %err, task_name = %task_name, "nack(error) failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 4,
            drain_timeout: Duration::from_millis(500),
            recover_grace: Duration::from_secs(300),
            consume_block: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn single_success_acks_and_empties_queue() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let worker = Worker::new("emails", broker.clone(), test_config());
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let task = worker.register(
            "send_email",
            TaskOptions::new(),
            move |_args: Value, _kwargs: Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Success)
                }
            },
        );
        task.send(serde_json::json!(["a", "s", "b"]), serde_json::json!({})).await.unwrap();
        assert_eq!(broker.size(task.queue()).await.unwrap(), 1);

        let worker_clone = worker.clone();
        let handle = tokio::spawn(async move { worker_clone.start().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.shutdown();
        handle.await.unwrap().unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(broker.size(task.queue()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn max_tries_exhaustion_rejects_third_attempt() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let worker = Worker::new("retries", broker.clone(), test_config());
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let task = worker.register(
            "always_retry",
            TaskOptions::new().max_tries(2),
            move |_args: Value, _kwargs: Value| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Retry { delay: Duration::from_millis(10) })
                }
            },
        );
        task.send(Value::Null, Value::Null).await.unwrap();

        let worker_clone = worker.clone();
        let handle = tokio::spawn(async move { worker_clone.start().await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.shutdown();
        handle.await.unwrap().unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 2);
        assert_eq!(broker.size(task.queue()).await.unwrap(), 0);
    }
}
