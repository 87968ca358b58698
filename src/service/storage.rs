//! `Storage`: keyed items with aliases (pointing to exactly one primary)
//! and set collections (§3, §4.8, §6).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ServiceError;

/// A stored item: `(primary_id, value, aliases, collections)` (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub primary_id: String,
    pub value: Value,
    pub aliases: HashSet<String>,
    pub collections: HashSet<String>,
}

/// One entry of a collection scan: either just the id, or the full item.
#[derive(Debug, Clone)]
pub enum CollectionEntry {
    Id(String),
    Item(Item),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically detaches `id`'s previous aliases/collection memberships,
    /// reassigns any aliases that currently point elsewhere, and installs
    /// the new item (§4.8).
    async fn save(
        &self,
        id: &str,
        value: Value,
        aliases: &[String],
        collections: &[String],
    ) -> Result<(), ServiceError>;

    async fn get(&self, id: &str, default: Option<Value>) -> Option<Value>;

    async fn get_item(&self, id: &str) -> Option<Item>;

    /// Deletes a primary: its aliases and collection memberships go with it.
    async fn delete(&self, id: &str) -> Result<(), ServiceError>;

    /// Points `alias` at `primary`, atomically detaching it from any prior
    /// primary.
    async fn add_alias(&self, primary: &str, alias: &str) -> Result<(), ServiceError>;

    async fn delete_alias(&self, alias: &str) -> Result<(), ServiceError>;

    async fn get_collection(&self, id: &str, only_ids: bool) -> Vec<CollectionEntry>;

    /// Removes membership only, unless `delete_items` cascades to the items
    /// themselves (and then their aliases and other collection
    /// memberships).
    async fn delete_collection(&self, id: &str, delete_items: bool) -> Result<(), ServiceError>;
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, Item>,
    aliases: HashMap<String, String>,
    collections: HashMap<String, HashSet<String>>,
}

/// Reference in-memory implementation. A single `Mutex`-guarded critical
/// section stands in for the server-side script a remote backend would use
/// (§4.8).
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn detach_item(inner: &mut Inner, id: &str) {
        if let Some(old) = inner.items.remove(id) {
            for alias in &old.aliases {
                inner.aliases.remove(alias);
            }
            for collection in &old.collections {
                if let Some(members) = inner.collections.get_mut(collection) {
                    members.remove(id);
                }
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(
        &self,
        id: &str,
        value: Value,
        aliases: &[String],
        collections: &[String],
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().unwrap();

        // Detach this primary's previous aliases/collections first.
        Self::detach_item(&mut inner, id);

        // Reassign aliases that currently point elsewhere.
        for alias in aliases {
            if let Some(previous_primary) = inner.aliases.get(alias).cloned() {
                if previous_primary != id {
                    if let Some(previous_item) = inner.items.get_mut(&previous_primary) {
                        previous_item.aliases.remove(alias);
                    }
                }
            }
            inner.aliases.insert(alias.clone(), id.to_string());
        }

        for collection in collections {
            inner
                .collections
                .entry(collection.clone())
                .or_default()
                .insert(id.to_string());
        }

        inner.items.insert(
            id.to_string(),
            Item {
                primary_id: id.to_string(),
                value,
                aliases: aliases.iter().cloned().collect(),
                collections: collections.iter().cloned().collect(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str, default: Option<Value>) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .get(id)
            .map(|item| item.value.clone())
            .or(default)
    }

    async fn get_item(&self, id: &str) -> Option<Item> {
        self.inner.lock().unwrap().items.get(id).cloned()
    }

    async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        Self::detach_item(&mut inner, id);
        Ok(())
    }

    async fn add_alias(&self, primary: &str, alias: &str) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.items.contains_key(primary) {
            return Err(ServiceError::NotFound(primary.to_string()));
        }
        if let Some(previous_primary) = inner.aliases.get(alias).cloned() {
            if previous_primary != primary {
                if let Some(previous_item) = inner.items.get_mut(&previous_primary) {
                    previous_item.aliases.remove(alias);
                }
            }
        }
        inner.aliases.insert(alias.to_string(), primary.to_string());
        if let Some(item) = inner.items.get_mut(primary) {
            item.aliases.insert(alias.to_string());
        }
        Ok(())
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(primary) = inner.aliases.remove(alias) {
            if let Some(item) = inner.items.get_mut(&primary) {
                item.aliases.remove(alias);
            }
        }
        Ok(())
    }

    async fn get_collection(&self, id: &str, only_ids: bool) -> Vec<CollectionEntry> {
        let inner = self.inner.lock().unwrap();
        let Some(members) = inner.collections.get(id) else {
            return Vec::new();
        };
        members
            .iter()
            .map(|member_id| {
                if only_ids {
                    CollectionEntry::Id(member_id.clone())
                } else {
                    match inner.items.get(member_id) {
                        Some(item) => CollectionEntry::Item(item.clone()),
                        None => CollectionEntry::Id(member_id.clone()),
                    }
                }
            })
            .collect()
    }

    async fn delete_collection(&self, id: &str, delete_items: bool) -> Result<(), ServiceError> {
        let members = {
            let mut inner = self.inner.lock().unwrap();
            inner.collections.remove(id).unwrap_or_default()
        };
        if delete_items {
            for member_id in members {
                self.delete(&member_id).await?;
            }
        } else {
            let mut inner = self.inner.lock().unwrap();
            for member_id in members {
                if let Some(item) = inner.items.get_mut(&member_id) {
                    item.collections.remove(id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reassigning_an_alias_detaches_it_from_the_old_primary() {
        let storage = MemoryStorage::new();
        storage
            .save("a", Value::from(1), &["shared".to_string()], &[])
            .await
            .unwrap();
        storage
            .save("b", Value::from(2), &["shared".to_string()], &[])
            .await
            .unwrap();

        let a = storage.get_item("a").await.unwrap();
        assert!(!a.aliases.contains("shared"));
        let b = storage.get_item("b").await.unwrap();
        assert!(b.aliases.contains("shared"));
    }

    #[tokio::test]
    async fn deleting_a_primary_removes_its_aliases_and_collection_membership() {
        let storage = MemoryStorage::new();
        storage
            .save(
                "a",
                Value::from(1),
                &["alias-a".to_string()],
                &["group".to_string()],
            )
            .await
            .unwrap();
        storage.delete("a").await.unwrap();

        assert!(storage.get_item("a").await.is_none());
        assert!(storage.get("alias-a", None).await.is_none());
        assert!(storage.get_collection("group", true).await.is_empty());
    }

    #[tokio::test]
    async fn delete_collection_without_cascade_only_removes_membership() {
        let storage = MemoryStorage::new();
        storage
            .save("a", Value::from(1), &[], &["group".to_string()])
            .await
            .unwrap();
        storage.delete_collection("group", false).await.unwrap();

        assert!(storage.get_item("a").await.is_some());
        assert!(storage.get_collection("group", true).await.is_empty());
    }

    #[tokio::test]
    async fn delete_collection_with_cascade_deletes_items() {
        let storage = MemoryStorage::new();
        storage
            .save("a", Value::from(1), &[], &["group".to_string()])
            .await
            .unwrap();
        storage.delete_collection("group", true).await.unwrap();

        assert!(storage.get_item("a").await.is_none());
    }
}
