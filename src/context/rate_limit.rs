//! Rate limiting (§4.6): a suspended guard over a per-processor key that
//! additionally counts invocations against a threshold, converting an
//! exceeded count into the same drop/retry/cooldown machinery the
//! suspended guard already provides.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::service::{key, Lock, RateCounter};

use super::lock_guard::{GuardPolicy, SuspendedGuard};
use super::manager::{ContextContribution, ContextManager};
use super::Context;

pub struct RateLimitDecoration {
    guard: SuspendedGuard,
    rate_counter: Arc<dyn RateCounter>,
    counter_key: String,
    limit: i64,
    threshold: Duration,
}

impl RateLimitDecoration {
    pub fn new(
        lock: Arc<dyn Lock>,
        rate_counter: Arc<dyn RateCounter>,
        processor_id: impl Into<String>,
        limit: i64,
        threshold: Duration,
        policy: GuardPolicy,
    ) -> Self {
        let processor_id = processor_id.into();
        let suspend_key = key(&["rate_limit", &processor_id]);
        Self {
            guard: SuspendedGuard::new(lock, suspend_key.clone(), policy),
            rate_counter,
            counter_key: suspend_key,
            limit,
            threshold,
        }
    }
}

#[async_trait]
impl ContextManager for RateLimitDecoration {
    async fn enter(&self, ctx: &Context) -> Result<ContextContribution, EngineError> {
        self.guard.enter(ctx).await?;
        let (value, expiry) = self
            .rate_counter
            .increment(&self.counter_key, 1, self.threshold)
            .await;
        if value > self.limit {
            return Err(EngineError::RateLimitExceeded { retry_in: expiry });
        }
        Ok(ContextContribution::new())
    }

    async fn exit(
        &self,
        ctx: &Context,
        error: Option<&EngineError>,
    ) -> Result<bool, EngineError> {
        self.guard.exit(ctx, error).await
    }
}

pub fn rate_limit_guard(
    lock: Arc<dyn Lock>,
    rate_counter: Arc<dyn RateCounter>,
    processor_id: impl Into<String>,
    limit: i64,
    threshold: Duration,
    policy: GuardPolicy,
) -> Arc<dyn ContextManager> {
    Arc::new(RateLimitDecoration::new(
        lock,
        rate_counter,
        processor_id,
        limit,
        threshold,
        policy,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MemoryLock, MemoryRateCounter};

    #[tokio::test]
    async fn exceeding_limit_raises_rate_limit_exceeded_then_suspends_siblings() {
        let lock: Arc<dyn Lock> = Arc::new(MemoryLock::new());
        let rate_counter: Arc<dyn RateCounter> = Arc::new(MemoryRateCounter::new());
        let decoration = RateLimitDecoration::new(
            lock,
            rate_counter,
            "p1",
            2,
            Duration::from_secs(60),
            GuardPolicy::Retry,
        );
        let ctx = Context::new();

        assert!(decoration.enter(&ctx).await.is_ok());
        decoration.exit(&ctx, None).await.unwrap();
        assert!(decoration.enter(&ctx).await.is_ok());
        decoration.exit(&ctx, None).await.unwrap();

        let err = decoration.enter(&ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimitExceeded { .. }));
        decoration.exit(&ctx, Some(&err)).await.unwrap();

        let err2 = decoration.enter(&ctx).await.unwrap_err();
        assert!(matches!(err2, EngineError::RetryMessage { .. }));
    }
}
