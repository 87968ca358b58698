//! Singleton and suspended guards (§4.6): lock-backed exclusion and
//! cooldown decorations that every other guard-like decoration
//! (cursor, rate limit) composes with rather than reimplements.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::service::{Lock, LockState};

use super::manager::{ContextContribution, ContextManager};
use super::{Context, ContextValue, Slot};

/// Present in context (as a [`SingletonProlong`] service) whenever a
/// [`SingletonGuard`] is held for this invocation; the engine reads this
/// the same way it reads the cache recorder and wires a response filter
/// that prolongs the lock's TTL on every emit (§4.6).
pub const SINGLETON_PROLONG_KEY: &str = "__singleton_prolong";

/// Refreshes a held [`SingletonGuard`]'s TTL. A lock acquired with no TTL
/// (`expire_in: None`) is held until explicitly released, so there's
/// nothing to prolong and `prolong` is a no-op in that case.
pub struct SingletonProlong {
    lock: Arc<dyn Lock>,
    name: String,
    expire_in: Option<Duration>,
}

impl SingletonProlong {
    /// Fires the TTL extension in the background so emitting a message
    /// never blocks on it.
    pub fn prolong(&self) {
        let Some(expire_in) = self.expire_in else {
            return;
        };
        let lock = self.lock.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            lock.prolong(&name, expire_in).await;
        });
    }
}

/// What to do when a guard finds itself excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPolicy {
    Drop,
    Retry,
}

const DEFAULT_RETRY: Duration = Duration::from_secs(15);

/// Acquires a TTL lock on entry, releases on exit. Excluded invocations are
/// dropped or retried after the lock's remaining TTL (or 15s if unknown),
/// per `policy`.
pub struct SingletonGuard {
    lock: Arc<dyn Lock>,
    name: String,
    expire_in: Option<Duration>,
    policy: GuardPolicy,
}

impl SingletonGuard {
    pub fn new(
        lock: Arc<dyn Lock>,
        name: impl Into<String>,
        expire_in: Option<Duration>,
        policy: GuardPolicy,
    ) -> Self {
        Self {
            lock,
            name: name.into(),
            expire_in,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ContextManager for SingletonGuard {
    async fn enter(&self, _ctx: &Context) -> Result<ContextContribution, EngineError> {
        if self.lock.acquire(&self.name, self.expire_in).await {
            let mut contribution = ContextContribution::new();
            contribution.insert(
                SINGLETON_PROLONG_KEY.to_string(),
                Slot::Resolved(ContextValue::service(Arc::new(SingletonProlong {
                    lock: self.lock.clone(),
                    name: self.name.clone(),
                    expire_in: self.expire_in,
                }))),
            );
            return Ok(contribution);
        }
        let retry_in = match self.lock.get(&self.name).await {
            LockState::RemainingSeconds(secs) => Duration::from_secs_f64(secs.max(0.0)),
            _ => DEFAULT_RETRY,
        };
        match self.policy {
            GuardPolicy::Drop => Err(EngineError::DropMessage),
            GuardPolicy::Retry => Err(EngineError::retry_in(retry_in)),
        }
    }

    async fn exit(
        &self,
        _ctx: &Context,
        _error: Option<&EngineError>,
    ) -> Result<bool, EngineError> {
        self.lock.release(&self.name).await;
        Ok(false)
    }
}

/// Builds a [`SingletonGuard`] as a trait object for pushing onto a
/// [`super::manager::ContextManagerStack`].
pub fn singleton_guard(
    lock: Arc<dyn Lock>,
    name: impl Into<String>,
    expire_in: Option<Duration>,
    policy: GuardPolicy,
) -> Arc<dyn ContextManager> {
    Arc::new(SingletonGuard::new(lock, name, expire_in, policy))
}

/// Inverted exclusion: the body runs freely while the lock is absent; once
/// set (by a prior invocation's exit, see below), invocations suspend for
/// the remaining TTL. A body that raises a retry-flavored error causes the
/// lock to be set for that error's `retry_in`, so sibling invocations
/// suspend too (§4.6).
pub struct SuspendedGuard {
    lock: Arc<dyn Lock>,
    name: String,
    policy: GuardPolicy,
}

impl SuspendedGuard {
    pub fn new(lock: Arc<dyn Lock>, name: impl Into<String>, policy: GuardPolicy) -> Self {
        Self {
            lock,
            name: name.into(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ContextManager for SuspendedGuard {
    async fn enter(&self, _ctx: &Context) -> Result<ContextContribution, EngineError> {
        match self.lock.get(&self.name).await {
            LockState::Absent => Ok(ContextContribution::new()),
            LockState::Present => match self.policy {
                GuardPolicy::Drop => Err(EngineError::DropMessage),
                GuardPolicy::Retry => Err(EngineError::retry_in(DEFAULT_RETRY)),
            },
            LockState::RemainingSeconds(secs) => match self.policy {
                GuardPolicy::Drop => Err(EngineError::DropMessage),
                GuardPolicy::Retry => Err(EngineError::retry_in(Duration::from_secs_f64(secs.max(0.0)))),
            },
        }
    }

    async fn exit(
        &self,
        _ctx: &Context,
        error: Option<&EngineError>,
    ) -> Result<bool, EngineError> {
        if let Some(retry_in) = error.and_then(EngineError::retry_delay) {
            self.lock.set(&self.name, Some(retry_in)).await;
        }
        Ok(false)
    }
}

pub fn suspended_guard(
    lock: Arc<dyn Lock>,
    name: impl Into<String>,
    policy: GuardPolicy,
) -> Arc<dyn ContextManager> {
    Arc::new(SuspendedGuard::new(lock, name, policy))
}

/// Converts a caught `RetryMessage` into `DropMessage` before it reaches the
/// engine, leaving other errors untouched. Used where retrying would re-run
/// a non-idempotent side effect (§4.6 supplemental).
pub struct PreventMessageRetry;

#[async_trait]
impl ContextManager for PreventMessageRetry {
    async fn enter(&self, _ctx: &Context) -> Result<ContextContribution, EngineError> {
        Ok(ContextContribution::new())
    }

    async fn exit(
        &self,
        _ctx: &Context,
        error: Option<&EngineError>,
    ) -> Result<bool, EngineError> {
        if matches!(error, Some(EngineError::RetryMessage { .. })) {
            return Err(EngineError::DropMessage);
        }
        Ok(false)
    }
}

pub fn prevent_message_retry() -> Arc<dyn ContextManager> {
    Arc::new(PreventMessageRetry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MemoryLock;

    #[tokio::test]
    async fn singleton_guard_excludes_second_acquirer() {
        let lock: Arc<dyn Lock> = Arc::new(MemoryLock::new());
        let guard = SingletonGuard::new(lock, "g", None, GuardPolicy::Drop);
        let ctx = Context::new();
        assert!(guard.enter(&ctx).await.is_ok());
        let err = guard.enter(&ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::DropMessage));
        guard.exit(&ctx, None).await.unwrap();
        assert!(guard.enter(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn suspended_guard_sets_lock_for_retry_delay_on_exit() {
        let lock: Arc<dyn Lock> = Arc::new(MemoryLock::new());
        let guard = SuspendedGuard::new(lock.clone(), "cool", GuardPolicy::Retry);
        let ctx = Context::new();
        assert!(guard.enter(&ctx).await.is_ok());
        guard
            .exit(&ctx, Some(&EngineError::retry_in(Duration::from_secs(30))))
            .await
            .unwrap();
        let err = guard.enter(&ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::RetryMessage { .. }));
    }

    #[tokio::test]
    async fn prevent_message_retry_converts_retry_to_drop_but_leaves_other_errors() {
        let layer = PreventMessageRetry;
        let ctx = Context::new();
        let result = layer.exit(&ctx, Some(&EngineError::retry())).await;
        assert!(matches!(result, Err(EngineError::DropMessage)));

        let result = layer.exit(&ctx, Some(&EngineError::Fatal("x".into()))).await;
        assert!(result.is_ok());
    }
}
