//! Collection/Items helpers (§4.8 supplemental): fan out one invocation
//! into one emission per item (or id) of a storage collection, layered on
//! top of the linear pipeline model rather than a new pipeline shape.

use crate::message::Message;
use crate::response::ResponseHandler;
use crate::service::storage::{CollectionEntry, Item};
use crate::service::Storage;

pub struct Collection;

impl Collection {
    /// Emits one message per full item in `collection_id`, built by `build`.
    pub async fn for_each(
        storage: &dyn Storage,
        collection_id: &str,
        response: &ResponseHandler,
        build: impl Fn(Item) -> Message,
    ) {
        for entry in storage.get_collection(collection_id, false).await {
            if let CollectionEntry::Item(item) = entry {
                response.emit_message(build(item), None, None);
            }
        }
    }
}

pub struct Items;

impl Items {
    /// Emits one message per id in `collection_id`, built by `build`.
    pub async fn for_each(
        storage: &dyn Storage,
        collection_id: &str,
        response: &ResponseHandler,
        build: impl Fn(String) -> Message,
    ) {
        for entry in storage.get_collection(collection_id, true).await {
            let id = match entry {
                CollectionEntry::Id(id) => id,
                CollectionEntry::Item(item) => item.primary_id,
            };
            response.emit_message(build(id), None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::storage::MemoryStorage;
    use serde_json::Value;

    #[tokio::test]
    async fn items_for_each_emits_one_message_per_id() {
        let storage = MemoryStorage::new();
        storage.save("a", Value::from(1), &[], &["g".into()]).await.unwrap();
        storage.save("b", Value::from(2), &[], &["g".into()]).await.unwrap();

        let response = ResponseHandler::new();
        Items::for_each(&storage, "g", &response, |id| {
            let mut m = Message::new();
            m.set("id", id);
            m
        })
        .await;

        let output = response.drain();
        assert_eq!(output.emissions.len(), 2);
    }
}
