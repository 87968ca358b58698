//! Result caching (§4.6): on a fingerprint hit, the recorded emissions are
//! replayed and the body never runs; on a miss, emissions produced during
//! the body are recorded and saved after a successful run.
//!
//! The decoration only owns the fingerprint lookup and the recorded-list
//! persistence; actually emitting the replay (or capturing live emissions
//! into the recorder) is the response handler's job once a body is running
//! under it. The contract between the two is the two well-known context
//! keys below.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::message::FrozenMessage;
use crate::service::{key, Cache};

use super::manager::{ContextContribution, ContextManager};
use super::{Context, ContextValue, Slot};

/// Present in context (as a JSON array of payloads) when this invocation is
/// a cache hit; the engine must skip the processor body and replay these
/// through the response instead.
pub const CACHE_REPLAY_KEY: &str = "__cache_replay";
/// Present in context (as a [`RecordedEmissions`] service) on a cache miss;
/// the response handler pushes every emitted payload here as it goes.
pub const CACHE_RECORDER_KEY: &str = "__cache_recorder";

/// Accumulates emitted payloads for a cache-miss invocation.
#[derive(Default)]
pub struct RecordedEmissions(Mutex<Vec<Value>>);

impl RecordedEmissions {
    pub fn record(&self, payload: Value) {
        self.0.lock().unwrap().push(payload);
    }

    fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

pub struct CacheDecoration {
    cache: Arc<dyn Cache>,
    processor_id: String,
    fingerprint_extra: Option<String>,
    expires_in: Option<Duration>,
}

impl CacheDecoration {
    pub fn new(
        cache: Arc<dyn Cache>,
        processor_id: impl Into<String>,
        fingerprint_extra: Option<String>,
        expires_in: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            processor_id: processor_id.into(),
            fingerprint_extra,
            expires_in,
        }
    }

    /// The cache key: `(processor_id, named params or message)` per the
    /// glossary's fingerprint definition. When the decoration was built
    /// with explicit key params (`fingerprint_extra`), those alone identify
    /// the entry; otherwise the arriving message participates, so two
    /// different messages to the same processor don't collide on the same
    /// cache slot.
    async fn fingerprint(&self, ctx: &Context) -> String {
        match &self.fingerprint_extra {
            Some(extra) => key(&["cache", &self.processor_id, extra]),
            None => key(&["cache", &self.processor_id, &self.message_fingerprint(ctx).await]),
        }
    }

    async fn message_fingerprint(&self, ctx: &Context) -> String {
        let Ok(frozen) = ctx.get_service::<FrozenMessage>("message").await else {
            return String::new();
        };
        let value = Value::Object(frozen.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        let mut hasher = DefaultHasher::new();
        value.to_string().hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }
}

#[async_trait]
impl ContextManager for CacheDecoration {
    async fn enter(&self, ctx: &Context) -> Result<ContextContribution, EngineError> {
        let mut contribution = ContextContribution::new();
        match self.cache.get(&self.fingerprint(ctx).await, None).await {
            Some(cached) => {
                contribution.insert(
                    CACHE_REPLAY_KEY.to_string(),
                    Slot::Resolved(ContextValue::Json(cached)),
                );
            }
            None => {
                contribution.insert(
                    CACHE_RECORDER_KEY.to_string(),
                    Slot::Resolved(ContextValue::service(Arc::new(RecordedEmissions::default()))),
                );
            }
        }
        Ok(contribution)
    }

    async fn exit(
        &self,
        ctx: &Context,
        error: Option<&EngineError>,
    ) -> Result<bool, EngineError> {
        if error.is_some() {
            return Ok(false);
        }
        if let Ok(recorded) = ctx.get_service::<RecordedEmissions>(CACHE_RECORDER_KEY).await {
            let payloads = recorded.take();
            let value = Value::Array(payloads);
            self.cache
                .save(&self.fingerprint(ctx).await, value, self.expires_in)
                .await;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MemoryCache;

    #[tokio::test]
    async fn second_invocation_with_same_fingerprint_replays_cached_emissions() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let decoration = CacheDecoration::new(cache, "p1", None, None);

        let ctx = Context::new();
        let contribution = decoration.enter(&ctx).await.unwrap();
        assert!(!contribution.contains_key(CACHE_REPLAY_KEY));
        let child = ctx.child_with_overrides(contribution);
        let recorder = child
            .get_service::<RecordedEmissions>(CACHE_RECORDER_KEY)
            .await
            .unwrap();
        recorder.record(Value::from("m1"));
        recorder.record(Value::from("m2"));
        decoration.exit(&child, None).await.unwrap();

        let ctx2 = Context::new();
        let contribution2 = decoration.enter(&ctx2).await.unwrap();
        let child2 = ctx2.child_with_overrides(contribution2);
        let replay = child2.get::<Vec<String>>(CACHE_REPLAY_KEY).await.unwrap();
        assert_eq!(replay, vec!["m1".to_string(), "m2".to_string()]);
    }

    fn ctx_with_message(value: serde_json::Value) -> Context {
        let ctx = Context::new();
        ctx.set_service(
            "message",
            Arc::new(crate::message::Message::from_value(value).to_frozen_ref()),
        );
        ctx
    }

    #[tokio::test]
    async fn different_messages_to_the_same_processor_do_not_share_a_cache_slot() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let decoration = CacheDecoration::new(cache, "p1", None, None);

        let ctx_a = ctx_with_message(serde_json::json!({"user_id": "a"}));
        let contribution_a = decoration.enter(&ctx_a).await.unwrap();
        let child_a = ctx_a.child_with_overrides(contribution_a);
        let recorder_a = child_a
            .get_service::<RecordedEmissions>(CACHE_RECORDER_KEY)
            .await
            .unwrap();
        recorder_a.record(Value::from("for-a"));
        decoration.exit(&child_a, None).await.unwrap();

        let ctx_b = ctx_with_message(serde_json::json!({"user_id": "b"}));
        let contribution_b = decoration.enter(&ctx_b).await.unwrap();
        assert!(
            !contribution_b.contains_key(CACHE_REPLAY_KEY),
            "a different message must not replay the first message's emissions"
        );
    }
}
