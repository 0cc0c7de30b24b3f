//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by brokers, the worker loop, and task registration.
#[derive(Error, Debug)]
pub enum LtqError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker unreachable at startup: {0}")]
    BrokerFatal(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for LtqError {
    fn from(err: serde_json::Error) -> Self {
        LtqError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for LtqError {
    fn from(err: redis::RedisError) -> Self {
        LtqError::Broker(err.to_string())
    }
}
