//! Lazy, cycle-checked context map (§3, §4.1) and the scoped-decoration
//! stack that layers around a processor invocation (§4.2).
//!
//! A [`Context`] is an arena of named slots: either an already-resolved
//! [`ContextValue`] or a [`ContextFactory`] that produces one the first time
//! it's read. Resolution is memoized per key and detects cycles via a
//! task-local resolution chain, matching the "arena keyed by name, chain is
//! task-local not a process global" design note.

mod cache;
mod cursor;
mod job;
mod lock_guard;
mod manager;
mod path;
mod pool;
mod quota;
mod rate_limit;

pub use cache::{CacheDecoration, RecordedEmissions, CACHE_RECORDER_KEY, CACHE_REPLAY_KEY};
pub use cursor::{CursorDecoration, CursorHandle};
pub use job::{Job, JobGuardDecoration};
pub use lock_guard::{
    prevent_message_retry, singleton_guard, suspended_guard, GuardPolicy, SingletonGuard,
    SingletonProlong, SuspendedGuard, SINGLETON_PROLONG_KEY,
};
pub use manager::{ContextContribution, ContextManager, ContextManagerStack};
pub use path::{Path, PathExpr};
pub use pool::{ContextPool, DistributedPool, EagerPool, LazyPool};
pub use quota::{Quota, QuotaPeriod, QuotaPool};
pub use rate_limit::{rate_limit_guard, RateLimitDecoration};

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ContextError;

/// A resolved context value: either plain JSON-like data or an opaque
/// service handle (storage/lock/cache pools, the response handler, ...).
#[derive(Clone)]
pub enum ContextValue {
    Json(Value),
    Service(Arc<dyn Any + Send + Sync>),
}

impl ContextValue {
    pub fn json(v: impl Into<Value>) -> Self {
        ContextValue::Json(v.into())
    }

    pub fn service<T: Any + Send + Sync>(v: Arc<T>) -> Self {
        ContextValue::Service(v)
    }
}

/// A lazily-evaluated context entry. `name` is the key it was resolved
/// under, matching the "name-aware factory variant" from §4.1.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn resolve(&self, name: &str, ctx: &Context) -> Result<ContextValue, ContextError>;
}

/// A factory built from a plain async closure, for the common case that
/// doesn't need the resolution name.
pub struct FnFactory<F>(pub F);

#[async_trait]
impl<F, Fut> ContextFactory for FnFactory<F>
where
    F: Fn(&Context) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ContextValue, ContextError>> + Send,
{
    async fn resolve(&self, _name: &str, ctx: &Context) -> Result<ContextValue, ContextError> {
        (self.0)(ctx).await
    }
}

pub(crate) enum Slot {
    Resolved(ContextValue),
    Factory(Arc<dyn ContextFactory>),
}

tokio::task_local! {
    static RESOLUTION_CHAIN: RefCell<Vec<String>>;
}

/// Pushes `name` onto the task-local resolution chain for the duration of
/// the guard, detecting cycles and popping on drop (including on error
/// unwind), so a factory that itself reads other keys can't loop forever.
struct ChainGuard {
    name: String,
}

impl ChainGuard {
    fn enter(name: &str) -> Result<Self, ContextError> {
        let cycle = RESOLUTION_CHAIN.try_with(|chain| {
            let mut chain = chain.borrow_mut();
            if chain.iter().any(|n| n == name) {
                let mut full = chain.clone();
                full.push(name.to_string());
                Some(full)
            } else {
                chain.push(name.to_string());
                None
            }
        });
        match cycle {
            Ok(Some(chain)) => Err(ContextError::Cycle {
                name: name.to_string(),
                chain,
            }),
            Ok(None) => Ok(ChainGuard {
                name: name.to_string(),
            }),
            // No chain scope active (top-level resolution outside a dispatch
            // loop, e.g. in tests): treat as a fresh, unshared chain.
            Err(_) => Ok(ChainGuard {
                name: name.to_string(),
            }),
        }
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        let _ = RESOLUTION_CHAIN.try_with(|chain| {
            let mut chain = chain.borrow_mut();
            if chain.last().map(|n| n == &self.name).unwrap_or(false) {
                chain.pop();
            }
        });
    }
}

/// Runs `fut` inside a fresh resolution-chain scope. The engine calls this
/// once per processor invocation; nested `Context::get` calls within share
/// the same chain for cycle detection.
pub async fn with_resolution_scope<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    RESOLUTION_CHAIN.scope(RefCell::new(Vec::new()), fut).await
}

/// The lazy, cycle-checked context map itself. Cheaply cloneable (an `Arc`
/// around interior-mutable slots) so child contexts built by the manager
/// stack can share unresolved parent entries without re-copying them.
#[derive(Clone)]
pub struct Context {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a child context pre-populated with `self`'s resolved and
    /// unresolved entries, then overlaid with `overrides` (outer priority,
    /// §4.2): a key `self` already defines wins over the same key in
    /// `overrides`, since `self` is always the accumulation of layers
    /// entered so far (outer) and `overrides` is the next, more deeply
    /// nested layer's contribution.
    pub fn child_with_overrides(&self, overrides: HashMap<String, Slot>) -> Context {
        let mut merged = {
            let parent = self.slots.read().unwrap();
            parent
                .iter()
                .map(|(k, v)| (k.clone(), clone_slot(v)))
                .collect::<HashMap<_, _>>()
        };
        for (k, v) in overrides {
            merged.entry(k).or_insert(v);
        }
        Context {
            slots: Arc::new(RwLock::new(merged)),
        }
    }

    pub fn set_json(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.slots
            .write()
            .unwrap()
            .insert(name.into(), Slot::Resolved(ContextValue::Json(value.into())));
    }

    pub fn set_service<T: Any + Send + Sync>(&self, name: impl Into<String>, value: Arc<T>) {
        self.slots.write().unwrap().insert(
            name.into(),
            Slot::Resolved(ContextValue::Service(value)),
        );
    }

    pub fn set_factory(&self, name: impl Into<String>, factory: Arc<dyn ContextFactory>) {
        self.slots
            .write()
            .unwrap()
            .insert(name.into(), Slot::Factory(factory));
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots.read().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.read().unwrap().contains_key(name)
    }

    /// Resolves `name`, memoizing the result and detecting resolution
    /// cycles (§4.1 steps 1-3).
    pub async fn get_value(&self, name: &str) -> Result<ContextValue, ContextError> {
        let factory = {
            let slots = self.slots.read().unwrap();
            match slots.get(name) {
                Some(Slot::Resolved(v)) => return Ok(v.clone()),
                Some(Slot::Factory(f)) => f.clone(),
                None => {
                    let mut available: Vec<String> = slots.keys().cloned().collect();
                    available.sort();
                    return Err(ContextError::Missing {
                        name: name.to_string(),
                        available,
                    });
                }
            }
        };

        let _guard = ChainGuard::enter(name)?;
        let value = factory.resolve(name, self).await?;

        self.slots
            .write()
            .unwrap()
            .insert(name.to_string(), Slot::Resolved(value.clone()));
        Ok(value)
    }

    /// Typed accessor over JSON-shaped values (§4.1's parameter-injection
    /// resolution order collapses, for Rust, into: explicit default if the
    /// key is absent, else the resolved context value).
    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ContextError> {
        match self.get_value(name).await? {
            ContextValue::Json(v) => {
                serde_json::from_value(v).map_err(|_| ContextError::TypeMismatch {
                    name: name.to_string(),
                })
            }
            ContextValue::Service(_) => Err(ContextError::TypeMismatch {
                name: name.to_string(),
            }),
        }
    }

    pub async fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        match self.get::<T>(name).await {
            Ok(v) => v,
            Err(ContextError::Missing { .. }) => default,
            Err(_) => default,
        }
    }

    pub async fn get_service<T: Any + Send + Sync>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, ContextError> {
        match self.get_value(name).await? {
            ContextValue::Service(s) => s.downcast::<T>().map_err(|_| ContextError::TypeMismatch {
                name: name.to_string(),
            }),
            ContextValue::Json(_) => Err(ContextError::TypeMismatch {
                name: name.to_string(),
            }),
        }
    }

    /// Resolves a [`Path`] against this context, returning `None` on any
    /// missing hop rather than propagating `ContextMissing` (§4.1).
    pub async fn get_path(&self, path: &Path) -> Option<Value> {
        path::resolve_path(self, path).await
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_slot(slot: &Slot) -> Slot {
    match slot {
        Slot::Resolved(v) => Slot::Resolved(v.clone()),
        Slot::Factory(f) => Slot::Factory(f.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolving_same_key_twice_is_memoized() {
        let ctx = Context::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        ctx.set_factory(
            "a",
            Arc::new(FnFactory(move |_: &Context| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(ContextValue::json(1))
                }
            })),
        );
        let _ = with_resolution_scope(async {
            let _: i64 = ctx.get("a").await.unwrap();
            let _: i64 = ctx.get("a").await.unwrap();
        })
        .await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_lists_available_keys() {
        let ctx = Context::new();
        ctx.set_json("known", 1);
        let err = with_resolution_scope(async { ctx.get::<i64>("missing").await })
            .await
            .unwrap_err();
        match err {
            ContextError::Missing { available, .. } => {
                assert_eq!(available, vec!["known".to_string()])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cyclic_factories_raise_context_cycle() {
        let ctx = Context::new();
        let ctx_a = ctx.clone();
        let ctx_b = ctx.clone();
        ctx.set_factory(
            "a",
            Arc::new(FnFactory(move |_: &Context| {
                let ctx_a = ctx_a.clone();
                async move {
                    let _ = ctx_a.get_value("b").await?;
                    Ok(ContextValue::json(1))
                }
            })),
        );
        ctx.set_factory(
            "b",
            Arc::new(FnFactory(move |_: &Context| {
                let ctx_b = ctx_b.clone();
                async move {
                    let _ = ctx_b.get_value("a").await?;
                    Ok(ContextValue::json(1))
                }
            })),
        );
        let err = with_resolution_scope(async { ctx.get_value("a").await })
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Cycle { .. }));
    }
}
