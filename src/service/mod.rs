//! Backend service contracts (§6): `Storage`, `Cache`, `Lock`, `Counter`,
//! `RateCounter`, `Metrics`, each with an in-memory reference
//! implementation. Real deployments plug in remote backends behind the
//! same trait.

use std::sync::Arc;

/// Wraps a trait-object service (`Arc<dyn Storage>` and friends) as a sized
/// type so it can travel through `Context::set_service`/`get_service`,
/// which downcast via `Any` and therefore need a concrete destination type.
#[derive(Clone)]
pub struct ServiceHandle<T: ?Sized>(pub Arc<T>);

pub mod cache;
pub mod counter;
pub mod cursor_storage;
pub mod lock;
pub mod metrics;
pub mod rate_counter;
pub mod storage;

pub use cache::{Cache, MemoryCache};
pub use counter::{Counter, MemoryCounter};
pub use cursor_storage::{CursorStorage, VersionedCursorStorage};
pub use lock::{Lock, LockState, MemoryLock};
pub use metrics::{LogMetrics, Metrics};
pub use rate_counter::{MemoryRateCounter, RateCounter};
pub use storage::{CollectionEntry, Item, MemoryStorage, Storage};

/// Joins key parts the way the originating service layer composes
/// compound keys (`(program_id, scheduler_id)`, `(processor_id, params)`,
/// ...), so the in-memory backends and the broker-backed scheduler use one
/// consistent key scheme.
pub fn key(parts: &[&str]) -> String {
    parts.join(":")
}
