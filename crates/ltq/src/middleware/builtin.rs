//! MaxTries, MaxAge, MaxRate — the default middleware stack.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::Middleware;
use crate::message::Message;
use crate::task::{Outcome, Task};

/// Rejects before the body runs once `ctx["tries"] >= max_tries`; otherwise,
/// on a retry signal from an inner layer, increments `ctx["tries"]`.
pub struct MaxTries;

#[async_trait]
impl Middleware for MaxTries {
    async fn before(&self, message: &mut Message, task: &Task) -> Option<Outcome> {
        let max_tries = task.options().max_tries?;
        let tries = message.ctx_get_u64("tries").unwrap_or(0);
        if tries >= max_tries as u64 {
            return Some(Outcome::Reject {
                reason: format!("max_tries ({max_tries}) exceeded"),
            });
        }
        None
    }

    async fn after(&self, message: &mut Message, _task: &Task, outcome: Outcome) -> Outcome {
        if let Outcome::Retry { .. } = &outcome {
            let tries = message.ctx_get_u64("tries").unwrap_or(0);
            message.ctx_set("tries", serde_json::json!(tries + 1));
        }
        outcome
    }
}

/// Rejects before the body runs once the Message is older than `max_age`.
pub struct MaxAge;

#[async_trait]
impl Middleware for MaxAge {
    async fn before(&self, message: &mut Message, task: &Task) -> Option<Outcome> {
        let max_age = task.options().max_age?;
        let age = message.age().to_std().unwrap_or(Duration::ZERO);
        if age > max_age {
            return Some(Outcome::Reject {
                reason: format!("max_age exceeded: {age:?} > {max_age:?}"),
            });
        }
        None
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self { tokens: capacity, capacity, rate_per_sec, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    /// Attempts to take one token. On failure returns the wait until one is available.
    fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - self.tokens) / self.rate_per_sec;
            Err(Duration::from_secs_f64(wait.max(0.0)))
        }
    }
}

/// Token bucket keyed by `task_name`, shared across all Messages of that task
/// on one Worker. Parses `task.options.max_rate` strings of the form `"N/u"`.
pub struct MaxRate {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MaxRate {
    pub fn new() -> Self {
        Self { buckets: RwLock::new(HashMap::new()) }
    }

    /// Parses `"N/u"`, `u` in `{s, m, h}`, into `(capacity, rate_per_sec)`.
    /// Capacity equals `N`: a fresh bucket allows a burst of `N` before throttling.
    fn parse_rate(spec: &str) -> Option<(f64, f64)> {
        let (count, unit) = spec.split_once('/')?;
        let count: f64 = count.trim().parse().ok()?;
        let window_secs = match unit.trim() {
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        Some((count, count / window_secs))
    }
}

impl Default for MaxRate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for MaxRate {
    async fn before(&self, _message: &mut Message, task: &Task) -> Option<Outcome> {
        let spec = task.options().max_rate.as_ref()?;
        let (capacity, rate_per_sec) = Self::parse_rate(spec)?;

        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets
            .entry(task.name().to_string())
            .or_insert_with(|| Bucket::new(capacity, rate_per_sec));

        match bucket.try_take() {
            Ok(()) => None,
            Err(wait) => Some(Outcome::Retry { delay: wait }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::task::TaskOptions;
    use serde_json::Value;
    use std::sync::Arc;

    fn task_with(options: TaskOptions) -> Task {
        Task::new(
            "q:f".into(),
            "q".into(),
            options,
            Arc::new(|_args: Value, _kwargs: Value| async move { Ok(Outcome::Success) }),
            Arc::new(MemoryBroker::new()),
        )
    }

    #[tokio::test]
    async fn max_tries_rejects_once_exhausted() {
        let task = task_with(TaskOptions::new().max_tries(2));
        let mut message = task.message(Value::Null, Value::Null);
        message.ctx_set("tries", serde_json::json!(2));
        let outcome = MaxTries.before(&mut message, &task).await;
        assert!(matches!(outcome, Some(Outcome::Reject { .. })));
    }

    #[tokio::test]
    async fn max_tries_allows_under_limit() {
        let task = task_with(TaskOptions::new().max_tries(2));
        let mut message = task.message(Value::Null, Value::Null);
        message.ctx_set("tries", serde_json::json!(1));
        assert!(MaxTries.before(&mut message, &task).await.is_none());
    }

    #[tokio::test]
    async fn max_tries_increments_on_retry() {
        let task = task_with(TaskOptions::new().max_tries(5));
        let mut message = task.message(Value::Null, Value::Null);
        let outcome = MaxTries
            .after(&mut message, &task, Outcome::Retry { delay: Duration::ZERO })
            .await;
        assert!(matches!(outcome, Outcome::Retry { .. }));
        assert_eq!(message.ctx_get_u64("tries"), Some(1));
    }

    #[tokio::test]
    async fn max_age_rejects_stale_messages() {
        let task = task_with(TaskOptions::new().max_age(Duration::from_secs(60)));
        let mut message = task.message(Value::Null, Value::Null);
        message.created_at = chrono::Utc::now() - chrono::Duration::seconds(120);
        let outcome = MaxAge.before(&mut message, &task).await;
        assert!(matches!(outcome, Some(Outcome::Reject { .. })));
    }

    #[tokio::test]
    async fn max_rate_throttles_past_capacity() {
        let task = task_with(TaskOptions::new().max_rate("2/s"));
        let mw = MaxRate::new();
        let mut message = task.message(Value::Null, Value::Null);
        assert!(mw.before(&mut message, &task).await.is_none());
        assert!(mw.before(&mut message, &task).await.is_none());
        let third = mw.before(&mut message, &task).await;
        assert!(matches!(third, Some(Outcome::Retry { .. })));
    }

    #[test]
    fn parse_rate_accepts_units() {
        assert_eq!(MaxRate::parse_rate("10/s"), Some((10.0, 10.0)));
        assert_eq!(MaxRate::parse_rate("60/m"), Some((60.0, 1.0)));
        assert_eq!(MaxRate::parse_rate("3600/h"), Some((3600.0, 1.0)));
        assert_eq!(MaxRate::parse_rate("bad"), None);
    }
}
