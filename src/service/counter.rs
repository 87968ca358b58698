//! `Counter`: unbounded increment-only accumulation (§3, §6).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

#[async_trait]
pub trait Counter: Send + Sync {
    async fn increment(&self, name: &str, value: i64) -> i64;
    async fn delete(&self, name: &str);
}

#[derive(Default)]
pub struct MemoryCounter {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Counter for MemoryCounter {
    async fn increment(&self, name: &str, value: i64) -> i64 {
        let mut values = self.values.lock().unwrap();
        let entry = values.entry(name.to_string()).or_insert(0);
        *entry += value;
        *entry
    }

    async fn delete(&self, name: &str) {
        self.values.lock().unwrap().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increment_accumulates_and_delete_clears() {
        let counter = MemoryCounter::new();
        assert_eq!(counter.increment("k", 1).await, 1);
        assert_eq!(counter.increment("k", 2).await, 3);
        counter.delete("k").await;
        assert_eq!(counter.increment("k", 1).await, 1);
    }
}
