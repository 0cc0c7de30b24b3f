//! Single-process broker satisfying the same contract as the Redis broker.
//! Thread-safe; no crash recovery is meaningful beyond in-process liveness,
//! but `recover` still reclaims leases that outlive `older_than` so the same
//! Worker code path exercises it in tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::Broker;
use crate::error::LtqError;
use crate::message::Message;
use crate::task::TaskId;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

struct InFlight {
    leased_at_ms: i64,
    message: Message,
}

#[derive(Default)]
struct QueueState {
    /// Visible set, ordered by (score, insertion sequence).
    visible: Vec<(i64, u64, Message)>,
    next_seq: u64,
    /// worker_id -> id -> in-flight entry.
    inflight: HashMap<String, HashMap<TaskId, InFlight>>,
}

impl QueueState {
    fn push_visible(&mut self, score_ms: i64, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.visible.push((score_ms, seq, message));
    }

    fn pop_due(&mut self, now_ms: i64, count: usize) -> Vec<Message> {
        self.visible.sort_by_key(|(score, seq, _)| (*score, *seq));
        let due = self.visible.iter().take_while(|(score, _, _)| *score <= now_ms).count();
        let take = due.min(count);
        self.visible.drain(0..take).map(|(_, _, msg)| msg).collect()
    }
}

/// In-memory, single-process broker.
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, message: Message, delay: Duration) -> Result<(), LtqError> {
        let score_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_default();
        // Idempotent on id: drop any existing visible copy with the same id first.
        state.visible.retain(|(_, _, m)| m.id != message.id);
        state.push_visible(score_ms, message);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        worker_id: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Message>, LtqError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let messages = {
                let mut queues = self.queues.lock().unwrap();
                let state = queues.entry(queue.to_string()).or_default();
                let now_ms = Utc::now().timestamp_millis();
                let due = state.pop_due(now_ms, count);
                if !due.is_empty() {
                    let worker_inflight = state.inflight.entry(worker_id.to_string()).or_default();
                    for message in &due {
                        worker_inflight.insert(
                            message.id,
                            InFlight { leased_at_ms: now_ms, message: message.clone() },
                        );
                    }
                }
                due
            };

            if !messages.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(tokio::time::Instant::now()))).await;
        }
    }

    async fn ack(&self, queue: &str, worker_id: &str, message: &Message) -> Result<(), LtqError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(queue) {
            if let Some(worker_inflight) = state.inflight.get_mut(worker_id) {
                worker_inflight.remove(&message.id);
            }
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        worker_id: &str,
        message: &Message,
        delay: Duration,
        drop: bool,
    ) -> Result<(), LtqError> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_default();
        if let Some(worker_inflight) = state.inflight.get_mut(worker_id) {
            worker_inflight.remove(&message.id);
        }
        if !drop {
            let score_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            state.push_visible(score_ms, message.clone());
        }
        Ok(())
    }

    async fn recover(&self, queue: &str, older_than: Duration) -> Result<usize, LtqError> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_default();
        let now_ms = Utc::now().timestamp_millis();
        let cutoff_ms = older_than.as_millis() as i64;
        let mut reclaimed = 0usize;
        for worker_inflight in state.inflight.values_mut() {
            let expired: Vec<TaskId> = worker_inflight
                .iter()
                .filter(|(_, entry)| now_ms - entry.leased_at_ms > cutoff_ms)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(entry) = worker_inflight.remove(&id) {
                    reclaimed += 1;
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.visible.push((now_ms, seq, entry.message));
                }
            }
        }
        Ok(reclaimed)
    }

    async fn size(&self, queue: &str) -> Result<usize, LtqError> {
        let queues = self.queues.lock().unwrap();
        Ok(queues.get(queue).map(|s| s.visible.len()).unwrap_or(0))
    }

    async fn clear(&self, queue: &str) -> Result<(), LtqError> {
        let mut queues = self.queues.lock().unwrap();
        queues.remove(queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn msg(name: &str) -> Message {
        Message::new(name, Value::Null, Value::Null)
    }

    #[tokio::test]
    async fn publish_then_consume_zero_delay() {
        let broker = MemoryBroker::new();
        broker.publish("q", msg("q:f"), Duration::ZERO).await.unwrap();
        assert_eq!(broker.size("q").await.unwrap(), 1);
        let got = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(broker.size("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_publish_not_visible_until_due() {
        let broker = MemoryBroker::new();
        broker.publish("q", msg("q:f"), Duration::from_millis(200)).await.unwrap();
        let immediate = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        assert!(immediate.is_empty());
        tokio::time::sleep(Duration::from_millis(250)).await;
        let later = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn ack_removes_from_inflight() {
        let broker = MemoryBroker::new();
        broker.publish("q", msg("q:f"), Duration::ZERO).await.unwrap();
        let got = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        broker.ack("q", "w1", &got[0]).await.unwrap();
        // Idempotent: a second ack on the same (already-removed) message is a no-op.
        broker.ack("q", "w1", &got[0]).await.unwrap();
        assert_eq!(broker.recover("q", Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_with_delay_requeues() {
        let broker = MemoryBroker::new();
        broker.publish("q", msg("q:f"), Duration::ZERO).await.unwrap();
        let got = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        let mut retried = got[0].clone();
        retried.ctx_set("tries", serde_json::json!(1));
        broker.nack("q", "w1", &retried, Duration::from_millis(50), false).await.unwrap();
        assert_eq!(broker.size("q").await.unwrap(), 1);
        let empty = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        assert!(empty.is_empty());
        tokio::time::sleep(Duration::from_millis(75)).await;
        let again = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].ctx_get_u64("tries"), Some(1));
    }

    #[tokio::test]
    async fn nack_with_drop_discards() {
        let broker = MemoryBroker::new();
        broker.publish("q", msg("q:f"), Duration::ZERO).await.unwrap();
        let got = broker.consume("q", "w1", 10, Duration::ZERO).await.unwrap();
        broker.nack("q", "w1", &got[0], Duration::ZERO, true).await.unwrap();
        assert_eq!(broker.size("q").await.unwrap(), 0);
        assert_eq!(broker.recover("q", Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_reclaims_expired_leases() {
        let broker = MemoryBroker::new();
        broker.publish("q", msg("q:f"), Duration::ZERO).await.unwrap();
        broker.consume("q", "dead-worker", 10, Duration::ZERO).await.unwrap();
        assert_eq!(broker.size("q").await.unwrap(), 0);
        let reclaimed = broker.recover("q", Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(broker.size("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_removes_visible_and_inflight() {
        let broker = MemoryBroker::new();
        broker.publish("q", msg("q:f"), Duration::ZERO).await.unwrap();
        broker.publish("q", msg("q:g"), Duration::from_secs(10)).await.unwrap();
        broker.clear("q").await.unwrap();
        assert_eq!(broker.size("q").await.unwrap(), 0);
    }
}
