//! Cursor persistence (§6 "Persisted layouts", §8 scenario 6): plain
//! per-key cursors, plus a versioned variant where a lookup at version `v`
//! returns the greatest stored version `<= v`, falling back to the
//! unversioned value for migration from a pre-versioning deployment.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use super::storage::{CollectionEntry, Storage};

const ALL_CURSORS_COLLECTION: &str = "all_cursors";

fn unversioned_id(name: &str) -> String {
    format!("cursor:{name}")
}

/// Plain cursor storage: `storage.cursor` in the persisted-layout table.
pub struct CursorStorage {
    storage: Arc<dyn Storage>,
}

impl CursorStorage {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.storage.get(&unversioned_id(name), None).await
    }

    pub async fn set(&self, name: &str, value: Value) {
        let _ = self
            .storage
            .save(
                &unversioned_id(name),
                value,
                &[],
                &[ALL_CURSORS_COLLECTION.to_string()],
            )
            .await;
    }

    pub async fn list(&self) -> Vec<String> {
        self.storage
            .get_collection(ALL_CURSORS_COLLECTION, true)
            .await
            .into_iter()
            .filter_map(|entry| match entry {
                CollectionEntry::Id(id) => id.strip_prefix("cursor:").map(str::to_string),
                CollectionEntry::Item(item) => {
                    item.primary_id.strip_prefix("cursor:").map(str::to_string)
                }
            })
            .collect()
    }

    /// Deletes one cursor by name.
    pub async fn delete(&self, name: &str) {
        let _ = self.storage.delete(&unversioned_id(name)).await;
    }

    /// Deletes every cursor.
    pub async fn clear(&self) {
        let _ = self
            .storage
            .delete_collection(ALL_CURSORS_COLLECTION, true)
            .await;
    }
}

fn parse_version(v: &str) -> Vec<u64> {
    v.split('.').map(|part| part.parse().unwrap_or(0)).collect()
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    parse_version(a).cmp(&parse_version(b))
}

fn versioned_id(name: &str, version: &str) -> String {
    format!("cursor:{name}@{version}")
}

fn version_collection(version: &str) -> String {
    format!("cursor_version:{version}")
}

/// Versioned cursor storage (§6, §8 scenario 6). Each write is additionally
/// filed under `cursor_version:<version>`, the cursor's own grouping
/// collection (`name`), and `all_cursors`.
pub struct VersionedCursorStorage {
    storage: Arc<dyn Storage>,
}

impl VersionedCursorStorage {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn set(&self, name: &str, version: &str, value: Value) {
        let id = versioned_id(name, version);
        let _ = self
            .storage
            .save(
                &id,
                value,
                &[],
                &[
                    version_collection(version),
                    name.to_string(),
                    ALL_CURSORS_COLLECTION.to_string(),
                ],
            )
            .await;
    }

    /// Returns the value stored at the greatest version `<= version`,
    /// falling back to the unversioned value if no versioned entry
    /// qualifies (migration path).
    pub async fn get(&self, name: &str, version: &str) -> Option<Value> {
        let entries = self.storage.get_collection(name, false).await;
        let mut best: Option<(Vec<u64>, Value)> = None;
        for entry in entries {
            let CollectionEntry::Item(item) = entry else {
                continue;
            };
            let Some(entry_version) = item.primary_id.rsplit_once('@').map(|(_, v)| v) else {
                continue;
            };
            if compare_versions(entry_version, version) == Ordering::Greater {
                continue;
            }
            let parsed = parse_version(entry_version);
            let better = match &best {
                Some((current, _)) => parsed > *current,
                None => true,
            };
            if better {
                best = Some((parsed, item.value));
            }
        }
        match best {
            Some((_, value)) => Some(value),
            None => self.storage.get(&unversioned_id(name), None).await,
        }
    }

    /// Deletes every cursor written at exactly `version`, restoring reads to
    /// fall through to the next-lower version (or the unversioned value).
    pub async fn clear_version(&self, version: &str) {
        let _ = self
            .storage
            .delete_collection(&version_collection(version), true)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::storage::MemoryStorage;

    #[tokio::test]
    async fn cursor_roundtrips_through_storage() {
        let backend = Arc::new(MemoryStorage::new());
        let cursors = CursorStorage::new(backend);
        cursors.set("c", Value::from("v1")).await;
        assert_eq!(cursors.get("c").await, Some(Value::from("v1")));
        assert_eq!(cursors.list().await, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn versioned_lookup_falls_back_to_lower_version_and_clearing_restores_it() {
        let backend = Arc::new(MemoryStorage::new());
        let cursors = VersionedCursorStorage::new(backend);

        cursors.set("c", "1.0.0", Value::from("v1")).await;
        assert_eq!(cursors.get("c", "2.0.0").await, Some(Value::from("v1")));

        cursors.set("c", "2.0.0", Value::from("v2")).await;
        assert_eq!(cursors.get("c", "2.0.0").await, Some(Value::from("v2")));

        cursors.clear_version("2.0.0").await;
        assert_eq!(cursors.get("c", "2.0.0").await, Some(Value::from("v1")));
    }
}
