//! Infrastructure selection (§5): which runtime drives the dispatch loop.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum InfrastructureKind {
    /// Single-caller, recursive, in-process dispatch.
    Inline,
    /// Bounded in-process worker pool draining an in-memory FIFO queue.
    WorkerPool { size: usize },
    /// Broker-backed, token-invalidated scheduler re-enqueue (§4.7).
    Broker {
        max_retries: u32,
        retry_backoff: Duration,
    },
}

impl Default for InfrastructureKind {
    fn default() -> Self {
        InfrastructureKind::Inline
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileInfrastructure {
    pub kind: Option<String>,
    pub worker_pool_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff_secs: Option<u64>,
}

impl InfrastructureKind {
    pub fn from_file(file: Option<FileInfrastructure>) -> Self {
        let Some(file) = file else { return Self::default() };
        match file.kind.as_deref() {
            Some("worker_pool") => InfrastructureKind::WorkerPool {
                size: file.worker_pool_size.unwrap_or(4),
            },
            Some("broker") => InfrastructureKind::Broker {
                max_retries: file.max_retries.unwrap_or(5),
                retry_backoff: Duration::from_secs(file.retry_backoff_secs.unwrap_or(30)),
            },
            _ => InfrastructureKind::Inline,
        }
    }
}
