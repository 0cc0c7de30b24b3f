//! The broker abstraction: at-least-once delivery with delayed visibility,
//! in-flight tracking, and crash recovery. Two implementations are provided:
//! [`memory::MemoryBroker`] (single-process, for tests and small deployments)
//! and, behind the `redis` feature, [`redis_broker::RedisBroker`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LtqError;
use crate::message::Message;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis_broker;

/// A queue-backed store of due-at-time-T Messages plus an in-flight set of
/// currently leased Messages, shared by every Worker talking to the same
/// backend.
///
/// `size` counts every member of the visible set regardless of score,
/// including messages not yet due — implementations must not special-case
/// delayed messages out of the count.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Makes `message` visible at `now + delay`. Republishing the same
    /// `message.id` while it is still in flight must not duplicate it in the
    /// visible set.
    async fn publish(&self, queue: &str, message: Message, delay: Duration) -> Result<(), LtqError>;

    /// Atomically moves up to `count` due messages from the visible set to
    /// this worker's in-flight set and returns them. `block` upper-bounds how
    /// long the call may wait for at least one message; returning fewer
    /// (including zero) before the bound elapses is always permitted.
    async fn consume(
        &self,
        queue: &str,
        worker_id: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Message>, LtqError>;

    /// Removes `message` from `worker_id`'s in-flight set and discards it.
    async fn ack(&self, queue: &str, worker_id: &str, message: &Message) -> Result<(), LtqError>;

    /// Removes `message` from `worker_id`'s in-flight set. If `drop`,
    /// discards it; otherwise republishes `message` (which may carry mutated
    /// `ctx`) with visibility at `now + delay`.
    async fn nack(
        &self,
        queue: &str,
        worker_id: &str,
        message: &Message,
        delay: Duration,
        drop: bool,
    ) -> Result<(), LtqError>;

    /// Reclaims in-flight messages across all workers of `queue` whose lease
    /// is older than `older_than`, returning them to the visible set at
    /// `now`. Returns the number reclaimed.
    async fn recover(&self, queue: &str, older_than: Duration) -> Result<usize, LtqError>;

    /// Count of visible messages for `queue`.
    async fn size(&self, queue: &str) -> Result<usize, LtqError>;

    /// Deletes all visible and in-flight messages for `queue`.
    async fn clear(&self, queue: &str) -> Result<(), LtqError>;
}

/// Dispatches on URL scheme: `redis://…` to the Redis broker, `memory://` to
/// the in-process broker.
pub async fn from_url(url: &str) -> Result<Arc<dyn Broker>, LtqError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(memory::MemoryBroker::new()));
    }

    #[cfg(feature = "redis")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let broker = redis_broker::RedisBroker::connect(url)
            .await
            .map_err(|e| LtqError::BrokerFatal(e.to_string()))?;
        return Ok(Arc::new(broker));
    }

    Err(LtqError::InvalidUrl(format!("unsupported broker url: {url}")))
}
