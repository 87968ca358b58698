//! `Lock`: TTL-bounded, strictly non-reentrant locks (§3, §6). Mediates
//! program liveness, guards, cursors, cached-context single-flight, and
//! scheduler triggers (§5).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// `get`'s three-way result: absent, present without TTL, or present with
/// the given number of seconds remaining.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockState {
    Absent,
    Present,
    RemainingSeconds(f64),
}

#[async_trait]
pub trait Lock: Send + Sync {
    /// "Set if absent with expiry". Non-reentrant: returns `false` if
    /// already held.
    async fn acquire(&self, name: &str, expire_in: Option<Duration>) -> bool;

    /// Unconditionally overwrites.
    async fn set(&self, name: &str, expire_in: Option<Duration>);

    async fn get(&self, name: &str) -> LockState;

    /// Extends an existing lock's TTL; returns `false` if absent.
    async fn prolong(&self, name: &str, expire_in: Duration) -> bool;

    async fn release(&self, name: &str) -> bool;
}

struct Entry {
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct MemoryLock {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn acquire(&self, name: &str, expire_in: Option<Duration>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(name) {
            if existing.is_live() {
                return false;
            }
        }
        entries.insert(
            name.to_string(),
            Entry {
                expires_at: expire_in.map(|d| Instant::now() + d),
            },
        );
        true
    }

    async fn set(&self, name: &str, expire_in: Option<Duration>) {
        self.entries.lock().unwrap().insert(
            name.to_string(),
            Entry {
                expires_at: expire_in.map(|d| Instant::now() + d),
            },
        );
    }

    async fn get(&self, name: &str) -> LockState {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(entry) if entry.is_live() => match entry.expires_at {
                None => LockState::Present,
                Some(at) => {
                    LockState::RemainingSeconds((at - Instant::now()).as_secs_f64().max(0.0))
                }
            },
            Some(_) => {
                entries.remove(name);
                LockState::Absent
            }
            None => LockState::Absent,
        }
    }

    async fn prolong(&self, name: &str, expire_in: Duration) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(name) {
            Some(entry) if entry.is_live() => {
                entry.expires_at = Some(Instant::now() + expire_in);
                true
            }
            _ => false,
        }
    }

    async fn release(&self, name: &str) -> bool {
        self.entries.lock().unwrap().remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_non_reentrant_until_release() {
        let lock = MemoryLock::new();
        assert!(lock.acquire("k", None).await);
        assert!(!lock.acquire("k", None).await);
        assert!(lock.release("k").await);
        assert!(lock.acquire("k", None).await);
    }

    #[tokio::test]
    async fn prolong_returns_false_when_absent() {
        let lock = MemoryLock::new();
        assert!(!lock.prolong("k", Duration::from_secs(1)).await);
        lock.acquire("k", Some(Duration::from_millis(10))).await;
        assert!(lock.prolong("k", Duration::from_secs(60)).await);
        match lock.get("k").await {
            LockState::RemainingSeconds(s) => assert!(s > 1.0),
            other => panic!("expected remaining seconds, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_succeeds_again_after_ttl_expiry() {
        let lock = MemoryLock::new();
        assert!(lock.acquire("k", Some(Duration::from_millis(1))).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(lock.acquire("k", None).await);
    }
}
