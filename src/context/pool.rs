//! Named context pools (§4.5): a pool hands back a service bound to an
//! arbitrary name (`lock.cursor`, `storage.job`, ...). Three shapes: eager
//! (factory per name, memoized), lazy (factory built once from the context
//! map), and distributed (context-map overrides per item, falling back to a
//! default).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::Context;

/// A pool that hands back a `T` bound to a name.
pub trait ContextPool<T>: Send + Sync {
    fn get(&self, name: &str) -> Arc<T>;
}

/// Eager pool: builds and memoizes one `T` per distinct name on first
/// access.
pub struct EagerPool<T> {
    factory: Box<dyn Fn(&str) -> T + Send + Sync>,
    cache: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: Send + Sync + 'static> EagerPool<T> {
    pub fn new(factory: impl Fn(&str) -> T + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Send + Sync + 'static> ContextPool<T> for EagerPool<T> {
    fn get(&self, name: &str) -> Arc<T> {
        if let Some(v) = self.cache.read().unwrap().get(name) {
            return v.clone();
        }
        let mut cache = self.cache.write().unwrap();
        cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::new((self.factory)(name)))
            .clone()
    }
}

/// Lazy pool: the underlying [`EagerPool`] is constructed once, the first
/// time it's needed, from the context map available at that point (used by
/// pools whose backend depends on a context-resolved dependency, e.g. a
/// storage handle).
pub struct LazyPool<T> {
    builder: Box<dyn Fn(&Context) -> EagerPool<T> + Send + Sync>,
    built: Mutex<Option<Arc<EagerPool<T>>>>,
}

impl<T: Send + Sync + 'static> LazyPool<T> {
    pub fn new(builder: impl Fn(&Context) -> EagerPool<T> + Send + Sync + 'static) -> Self {
        Self {
            builder: Box::new(builder),
            built: Mutex::new(None),
        }
    }

    pub fn get(&self, ctx: &Context, name: &str) -> Arc<T> {
        let mut built = self.built.lock().unwrap();
        if built.is_none() {
            *built = Some(Arc::new((self.builder)(ctx)));
        }
        built.as_ref().unwrap().get(name)
    }
}

/// Distributed pool: each item may be individually overridden in the
/// context map under `pool_name.item_name`; missing names fall back to
/// `pool_name.default`, and missing defaults fall back to the base pool.
pub struct DistributedPool<T> {
    pool_name: String,
    base: Arc<dyn ContextPool<T>>,
}

impl<T: Send + Sync + 'static> DistributedPool<T> {
    pub fn new(pool_name: impl Into<String>, base: Arc<dyn ContextPool<T>>) -> Self {
        Self {
            pool_name: pool_name.into(),
            base,
        }
    }

    /// Resolves `item_name`, preferring a context override at
    /// `<pool_name>.<item_name>`, then `<pool_name>.default`, then the base
    /// pool bound to `item_name`.
    pub async fn get(&self, ctx: &Context, item_name: &str) -> Arc<T>
    where
        T: serde::de::DeserializeOwned + Clone,
    {
        let specific_key = format!("{}.{}", self.pool_name, item_name);
        if let Ok(v) = ctx.get::<T>(&specific_key).await {
            return Arc::new(v);
        }
        let default_key = format!("{}.default", self.pool_name);
        if let Ok(v) = ctx.get::<T>(&default_key).await {
            return Arc::new(v);
        }
        self.base.get(item_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_pool_memoizes_per_name() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let pool = EagerPool::new(move |name: &str| {
            calls2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            name.to_string()
        });
        let a1 = pool.get("a");
        let a2 = pool.get("a");
        let _b1 = pool.get("b");
        assert_eq!(*a1, *a2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
