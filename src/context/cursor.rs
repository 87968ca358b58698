//! Cursor decoration (§4.6): wraps the body in a singleton guard, reads the
//! stored cursor value at entry, and exposes a dynamic property whose setter
//! is written back to storage on exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::service::{key, CursorStorage, Lock};

use super::lock_guard::{GuardPolicy, SingletonGuard};
use super::manager::{ContextContribution, ContextManager};
use super::{Context, ContextValue, Slot};

const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// The dynamic `cursor` (or `<name>_cursor`) property a processor body reads
/// and writes through. Contributed into the per-invocation context under
/// the decoration's `property_name`; the response handler built on top of
/// the context map exposes it as a plain read/write attribute.
pub struct CursorHandle {
    value: RwLock<Value>,
    dirty: AtomicBool,
}

impl CursorHandle {
    fn new(initial: Value) -> Self {
        Self {
            value: RwLock::new(initial),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> Value {
        self.value.read().unwrap().clone()
    }

    pub fn set(&self, value: impl Into<Value>) {
        *self.value.write().unwrap() = value.into();
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

pub struct CursorDecoration {
    guard: SingletonGuard,
    cursor_storage: Arc<CursorStorage>,
    storage_key: String,
    property_name: String,
}

impl CursorDecoration {
    /// `cursor_name` defaults to the processor id when the caller has no
    /// more specific name; `property_name` defaults to `"cursor"`.
    pub fn new(
        lock: Arc<dyn Lock>,
        cursor_storage: Arc<CursorStorage>,
        cursor_name: impl Into<String>,
        property_name: Option<String>,
        ttl: Option<Duration>,
    ) -> Self {
        let cursor_name = cursor_name.into();
        let lock_name = key(&["cursor", &cursor_name]);
        Self {
            guard: SingletonGuard::new(lock, lock_name, Some(ttl.unwrap_or(DEFAULT_TTL)), GuardPolicy::Retry),
            cursor_storage,
            storage_key: cursor_name,
            property_name: property_name.unwrap_or_else(|| "cursor".to_string()),
        }
    }
}

#[async_trait]
impl ContextManager for CursorDecoration {
    async fn enter(&self, ctx: &Context) -> Result<ContextContribution, EngineError> {
        let mut contribution = self.guard.enter(ctx).await?;
        let initial = self
            .cursor_storage
            .get(&self.storage_key)
            .await
            .unwrap_or(Value::Null);
        let handle = Arc::new(CursorHandle::new(initial));
        contribution.insert(
            self.property_name.clone(),
            Slot::Resolved(ContextValue::service(handle)),
        );
        Ok(contribution)
    }

    async fn exit(
        &self,
        ctx: &Context,
        error: Option<&EngineError>,
    ) -> Result<bool, EngineError> {
        if let Ok(handle) = ctx.get_service::<CursorHandle>(&self.property_name).await {
            if handle.is_dirty() {
                self.cursor_storage.set(&self.storage_key, handle.get()).await;
            }
        }
        self.guard.exit(ctx, error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MemoryLock, MemoryStorage};
    use crate::context::with_resolution_scope;

    #[tokio::test]
    async fn written_cursor_value_is_persisted_and_read_back_next_run() {
        let lock: Arc<dyn Lock> = Arc::new(MemoryLock::new());
        let backend = Arc::new(MemoryStorage::new());
        let cursors = Arc::new(CursorStorage::new(backend));

        let decoration = CursorDecoration::new(lock.clone(), cursors.clone(), "c", None, None);
        let ctx = Context::new();
        let contribution = decoration.enter(&ctx).await.unwrap();
        let child = ctx.child_with_overrides(contribution);

        with_resolution_scope(async {
            let handle = child.get_service::<CursorHandle>("cursor").await.unwrap();
            assert_eq!(handle.get(), Value::Null);
            handle.set("v1");
        })
        .await;
        decoration.exit(&child, None).await.unwrap();

        assert_eq!(cursors.get("c").await, Some(Value::from("v1")));

        let ctx2 = Context::new();
        let contribution2 = decoration.enter(&ctx2).await.unwrap();
        let child2 = ctx2.child_with_overrides(contribution2);
        let handle2 = child2.get_service::<CursorHandle>("cursor").await.unwrap();
        assert_eq!(handle2.get(), Value::from("v1"));
    }
}
