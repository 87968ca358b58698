//! Engine-wide error taxonomy.
//!
//! Processor bodies signal control-flow with [`EngineError`] instead of
//! panicking: `Retry`/`Drop` are routed by the dispatch loop (see
//! `crate::program::dispatch`), everything else is treated as a generic
//! failure that a broker-backed infrastructure may retry a bounded number
//! of times before moving the message to an error side-channel.

use std::time::Duration;

use thiserror::Error;

/// Errors a processor body, context manager, or guard may raise.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Re-enqueue the original message for the same processor.
    #[error("retry requested{}", .retry_in.map(|d| format!(" in {:?}", d)).unwrap_or_default())]
    RetryMessage { retry_in: Option<Duration> },

    /// Drop the message; flush whatever was already emitted.
    #[error("message dropped")]
    DropMessage,

    /// A rate limit's threshold was exceeded.
    #[error("rate limit exceeded, retry in {retry_in:?}")]
    RateLimitExceeded { retry_in: Duration },

    /// A quota's threshold was exceeded.
    #[error("quota {quota_name:?} exceeded for key {quota_key:?}, retry in {retry_in:?}")]
    QuotaExceeded {
        quota_name: String,
        quota_key: String,
        retry_in: Duration,
    },

    /// Configuration rejected at pool/service construction time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Carries structured diagnostic context alongside an arbitrary message.
    #[error("{message}")]
    Extended {
        message: String,
        extra: serde_json::Map<String, serde_json::Value>,
    },

    /// A fatal, non-retryable invariant violation (the Rust analogue of the
    /// originating implementation's `AssertionError` special case). Never
    /// retried; always routed straight to the error side-channel.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Any other processor-body failure. Bounded-retried by broker-backed
    /// infrastructures, then moved to the error side-channel.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn retry() -> Self {
        EngineError::RetryMessage { retry_in: None }
    }

    pub fn retry_in(d: Duration) -> Self {
        EngineError::RetryMessage {
            retry_in: Some(d),
        }
    }

    /// True for errors that must never be retried by an infrastructure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }

    /// `retry_in` carried by retry-flavored errors, if any.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            EngineError::RetryMessage { retry_in } => *retry_in,
            EngineError::RateLimitExceeded { retry_in } => Some(*retry_in),
            EngineError::QuotaExceeded { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// True for the `Retry`/`RateLimitExceeded`/`QuotaExceeded` family.
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            EngineError::RetryMessage { .. }
                | EngineError::RateLimitExceeded { .. }
                | EngineError::QuotaExceeded { .. }
        )
    }
}

/// Errors raised by context resolution (§4.1).
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context key {name:?} not found; available keys: {available:?}")]
    Missing {
        name: String,
        available: Vec<String>,
    },

    #[error("context cycle detected while resolving {name:?}; chain: {chain:?}")]
    Cycle { name: String, chain: Vec<String> },

    #[error("context value {name:?} has unexpected type")]
    TypeMismatch { name: String },

    #[error("cannot mutate a frozen message")]
    FrozenMessage,
}

/// Errors raised by `Storage`/`Cache`/`Lock`/`Counter` backends.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage item {0:?} not found")]
    NotFound(String),

    #[error("alias {0:?} already bound to a different primary")]
    AliasConflict(String),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
