//! `Cache`: keyed store with optional per-entry TTL (§3, §6).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn save(&self, key: &str, value: Value, expires_in: Option<Duration>);
    async fn get(&self, key: &str, default: Option<Value>) -> Option<Value>;
    async fn delete(&self, key: &str);

    async fn save_many(&self, entries: Vec<(String, Value)>, expires_in: Option<Duration>) {
        for (key, value) in entries {
            self.save(&key, value, expires_in).await;
        }
    }

    async fn get_many(&self, keys: &[String]) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for key in keys {
            if let Some(v) = self.get(key, None).await {
                out.insert(key.clone(), v);
            }
        }
        out
    }

    async fn delete_many(&self, keys: &[String]) {
        for key in keys {
            self.delete(key).await;
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn save(&self, key: &str, value: Value, expires_in: Option<Duration>) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: expires_in.map(|d| Instant::now() + d),
            },
        );
    }

    async fn get(&self, key: &str, default: Option<Value>) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.map(|at| Instant::now() >= at).unwrap_or(false) {
                    entries.remove(key);
                    default
                } else {
                    Some(entry.value.clone())
                }
            }
            None => default,
        }
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_default_when_absent() {
        let cache = MemoryCache::new();
        let fallback = Value::from("fallback");
        assert_eq!(
            cache.get("missing", Some(fallback.clone())).await,
            Some(fallback)
        );
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_absent() {
        let cache = MemoryCache::new();
        cache
            .save("k", Value::from(1), Some(Duration::from_millis(1)))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k", None).await, None);
    }
}
