//! Message model: mutable, frozen, and update views over an unordered
//! string-keyed payload (§3).

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::ContextError;

/// Reserved key set on event deliveries (§6).
pub const EVENT_KEY: &str = "_event";
/// Reserved key carrying a per-emission scheduler period override.
pub const SCHEDULER_PERIOD_KEY: &str = "_scheduler_period";
/// Reserved key prefix for job liveness tokens (`_job_<name>`).
pub const JOB_KEY_PREFIX: &str = "_job_";
/// Reserved keys populated on the broker error side-channel.
pub const EXCEPTION_KEY: &str = "_exception";
pub const EXC_TRACEBACK_KEY: &str = "_exc_traceback";

/// A mutable message: what processors construct and emit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: HashMap<String, Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: HashMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn freeze(self) -> FrozenMessage {
        FrozenMessage { fields: self.fields }
    }

    pub fn to_frozen_ref(&self) -> FrozenMessage {
        FrozenMessage {
            fields: self.fields.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Builds a message from a JSON object value; non-object values (or
    /// malformed cache/replay payloads) become an empty message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self {
                fields: map.into_iter().collect(),
            },
            _ => Self::new(),
        }
    }
}

impl From<HashMap<String, Value>> for Message {
    fn from(fields: HashMap<String, Value>) -> Self {
        Self { fields }
    }
}

/// An immutable view delivered to a processor body. Any attempt at mutation
/// is a programmer error surfaced as [`ContextError::FrozenMessage`] rather
/// than silently succeeding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrozenMessage {
    fields: HashMap<String, Value>,
}

impl FrozenMessage {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_mutable(&self) -> Message {
        Message {
            fields: self.fields.clone(),
        }
    }

    /// Mutation is always rejected; present so callers that hold a
    /// `FrozenMessage` by mistake get the documented client error instead of
    /// a type error at a call site far from the actual mistake.
    pub fn try_set(&mut self, _key: &str, _value: Value) -> Result<(), ContextError> {
        Err(ContextError::FrozenMessage)
    }
}

/// Tracks tombstoned keys alongside overrides so it can be merged back into
/// an original message (§3): `merge_with_message(original)` = original minus
/// tombstones, then overlaid with this update's keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    overrides: HashMap<String, Value>,
    tombstones: HashSet<String>,
}

impl MessageUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty() && self.tombstones.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.tombstones.remove(&key);
        self.overrides.insert(key, value.into());
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.overrides.remove(&key);
        self.tombstones.insert(key);
    }

    pub fn merge_with_message(&self, original: &FrozenMessage) -> Message {
        let mut fields: HashMap<String, Value> = original
            .iter()
            .filter(|(k, _)| !self.tombstones.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &self.overrides {
            fields.insert(k.clone(), v.clone());
        }
        Message { fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_removes_tombstones_then_overlays_overrides() {
        let mut original = Message::new();
        original.set("a", 1);
        original.set("b", 2);
        let frozen = original.freeze();

        let mut update = MessageUpdate::new();
        update.delete("a");
        update.set("c", 3);

        let merged = update.merge_with_message(&frozen);
        assert_eq!(merged.get("a"), None);
        assert_eq!(merged.get("b"), Some(&Value::from(2)));
        assert_eq!(merged.get("c"), Some(&Value::from(3)));
    }

    #[test]
    fn frozen_message_rejects_mutation() {
        let mut frozen = Message::new().freeze();
        assert!(frozen.try_set("a", Value::Null).is_err());
    }

    #[test]
    fn empty_message_is_empty() {
        assert!(Message::new().is_empty());
    }
}
