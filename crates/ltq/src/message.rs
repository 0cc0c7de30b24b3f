//! The unit of work carried by a broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::TaskId;

/// A Message is immutable after send except for `ctx`, which middleware may
/// grow across retries. `id`, `task_name`, and `created_at` never change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct Message {
    /// Unique identifier, assigned at creation, stable across retries.
    pub id: TaskId,
    /// `{queue}:{function}`.
    pub task_name: String,
    /// Positional arguments.
    pub args: Value,
    /// Keyword arguments.
    pub kwargs: Value,
    /// Open, string-keyed bag carried across retries and middleware layers.
    #[serde(default)]
    pub ctx: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(task_name: impl Into<String>, args: Value, kwargs: Value) -> Self {
        Self {
            id: TaskId::new(),
            task_name: task_name.into(),
            args,
            kwargs,
            ctx: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn ctx_get(&self, key: &str) -> Option<&Value> {
        self.ctx.get(key)
    }

    pub fn ctx_get_u64(&self, key: &str) -> Option<u64> {
        self.ctx.get(key).and_then(Value::as_u64)
    }

    pub fn ctx_set(&mut self, key: impl Into<String>, value: Value) {
        self.ctx.insert(key.into(), value);
    }

    /// Age since `created_at`, as a `chrono::Duration` (never negative; clock
    /// skew collapses to zero).
    pub fn age(&self) -> chrono::Duration {
        (Utc::now() - self.created_at).max(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_fresh_id_and_empty_ctx() {
        let msg = Message::new("emails:send_email", serde_json::json!(["a"]), serde_json::json!({}));
        assert_eq!(msg.task_name, "emails:send_email");
        assert!(msg.ctx.is_empty());
    }

    #[test]
    fn ctx_round_trips_through_json() {
        let mut msg = Message::new("q:f", Value::Null, Value::Null);
        msg.ctx_set("tries", serde_json::json!(2));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.task_name, msg.task_name);
        assert_eq!(decoded.ctx_get_u64("tries"), Some(2));
        assert_eq!(decoded.created_at, msg.created_at);
    }

    #[test]
    fn age_is_nonnegative() {
        let msg = Message::new("q:f", Value::Null, Value::Null);
        assert!(msg.age() >= chrono::Duration::zero());
    }
}
