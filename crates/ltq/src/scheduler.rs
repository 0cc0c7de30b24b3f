//! Cron-driven producer. Holds `(cron_expr, prototype_message)` entries and,
//! on `start`, repeatedly sleeps until the nearest next fire time and
//! publishes a fresh copy of every entry due at or before now.

#![cfg(feature = "scheduler")]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::error::LtqError;
use crate::message::Message;

struct Entry {
    schedule: Schedule,
    queue: String,
    task_name: String,
    args: serde_json::Value,
    kwargs: serde_json::Value,
}

/// A list of cron entries driving a single broker, in registration order.
/// Same-second ties fire in that order.
pub struct Scheduler {
    broker: Arc<dyn Broker>,
    entries: Vec<Entry>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker, entries: Vec::new(), shutdown: CancellationToken::new() }
    }

    /// Registers a cron entry. `cron_expr` follows the standard five/six
    /// field cron syntax supported by the `cron` crate. `queue` and
    /// `task_name` describe the prototype Message published at each fire.
    pub fn add(
        &mut self,
        cron_expr: &str,
        queue: impl Into<String>,
        task_name: impl Into<String>,
        args: serde_json::Value,
        kwargs: serde_json::Value,
    ) -> Result<(), LtqError> {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|e| LtqError::Configuration(format!("invalid cron expression {cron_expr:?}: {e}")))?;
        self.entries.push(Entry { schedule, queue: queue.into(), task_name: task_name.into(), args, kwargs });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawns `start` on its own Tokio task and returns the handle, for
    /// callers that want the scheduler running off their own control flow
    /// (mirroring how `Worker`/`App` are driven).
    pub fn start_background(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.start().await })
    }

    /// Runs the scheduling loop until `shutdown()` is called. Broker errors
    /// are logged and the affected entry is retried at its next tick; no
    /// entry is permanently dropped because of a transient failure.
    pub async fn start(&self) {
        if self.entries.is_empty() {
            return;
        }

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let now = Utc::now();
            let next_runs: Vec<(usize, chrono::DateTime<Utc>)> = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(i, entry)| entry.schedule.after(&now).next().map(|t| (i, t)))
                .collect();

            let Some(&(_, soonest)) = next_runs.iter().min_by_key(|(_, t)| *t) else {
                return;
            };

            let sleep_for = (soonest - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            let now = Utc::now();
            // Registration order, so same-second ties fire in that order.
            for (i, entry) in self.entries.iter().enumerate() {
                let due = next_runs.iter().any(|(idx, t)| *idx == i && *t <= now);
                if !due {
                    continue;
                }
                let message = Message::new(entry.task_name.clone(), entry.args.clone(), entry.kwargs.clone());
                if let Err(err) = self.broker.publish(&entry.queue, message, Duration::ZERO).await {
                    tracing::warn!(
                        task_name = %entry.task_name,
                        error = %err,
                        "scheduled publish failed; will retry at the next tick"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    #[tokio::test]
    async fn publishes_due_entry_and_stops_on_shutdown() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let mut scheduler = Scheduler::new(broker.clone());
        scheduler
            .add("* * * * * *", "reports", "reports:nightly", serde_json::json!([]), serde_json::json!({}))
            .unwrap();

        let shutdown = scheduler.shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.start().await });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(broker.size("reports").await.unwrap() >= 1);
    }

    #[test]
    fn rejects_invalid_cron_expression() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let mut scheduler = Scheduler::new(broker);
        let err = scheduler.add("not a cron expr", "q", "q:f", serde_json::json!([]), serde_json::json!({}));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn start_background_runs_off_callers_control_flow() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let mut scheduler = Scheduler::new(broker.clone());
        scheduler
            .add("* * * * * *", "reports", "reports:nightly", serde_json::json!([]), serde_json::json!({}))
            .unwrap();
        let scheduler = Arc::new(scheduler);
        let handle = scheduler.clone().start_background();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.shutdown();
        handle.await.unwrap();

        assert!(broker.size("reports").await.unwrap() >= 1);
    }
}
