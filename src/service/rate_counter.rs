//! `RateCounter`: a counter whose first increment opens a fixed-length
//! window; increments inside the window accumulate, after the window a
//! fresh one opens (§3, §6). Backs rate limiting and quotas (§4.6).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

#[async_trait]
pub trait RateCounter: Send + Sync {
    /// Returns `(new_value, seconds_to_expiry)`. The first increment on a
    /// key creates the window with `threshold` as its length; later
    /// increments before the window closes return the running total and
    /// the remaining seconds; after expiry a new window opens with `value`
    /// as the first entry.
    async fn increment(&self, name: &str, value: i64, threshold: Duration) -> (i64, Duration);
}

struct Window {
    total: i64,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryRateCounter {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryRateCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateCounter for MemoryRateCounter {
    async fn increment(&self, name: &str, value: i64, threshold: Duration) -> (i64, Duration) {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        match windows.get_mut(name) {
            Some(window) if window.expires_at > now => {
                window.total += value;
                (window.total, window.expires_at - now)
            }
            _ => {
                windows.insert(
                    name.to_string(),
                    Window {
                        total: value,
                        expires_at: now + threshold,
                    },
                );
                (value, threshold)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increments_within_window_accumulate() {
        let counter = MemoryRateCounter::new();
        let (v1, _) = counter.increment("k", 1, Duration::from_secs(60)).await;
        let (v2, _) = counter.increment("k", 2, Duration::from_secs(60)).await;
        assert_eq!(v1, 1);
        assert_eq!(v2, 3);
    }

    #[tokio::test]
    async fn new_window_opens_after_expiry() {
        let counter = MemoryRateCounter::new();
        counter.increment("k", 5, Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (v, _) = counter.increment("k", 1, Duration::from_secs(60)).await;
        assert_eq!(v, 1);
    }
}
