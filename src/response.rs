//! The response handler (§4.3): the per-invocation API a processor body
//! uses to emit messages, request retries, schedule work, send events, and
//! install filters. Owned by the engine for the duration of one invocation;
//! everything it accumulates is read back and flushed exactly once.
//!
//! "Dynamic properties" (`response.cursor = v`, §4.3's `set_property`)
//! collapse, for Rust, into named context services a decoration
//! contributes and the body fetches with `ctx.get_service::<T>(name)`
//! (see [`crate::context::CursorHandle`]) — there is no separate dynamic
//! attribute to emulate. The property bag here exists for the narrower
//! case of a processor body itself publishing an ad-hoc named value for a
//! context manager's `exit` to observe, modeled directly rather than via a
//! getter/setter pair (Rust has no use for the setter indirection once the
//! value is already a first-class `Arc<dyn Any>`).

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::message::{Message, MessageUpdate};

/// A filter applied to every outgoing message payload, in reverse
/// registration order (§4.3); returning `None` drops that particular
/// emission.
pub type MessageFilter = dyn Fn(Message) -> Option<Message> + Send + Sync;

/// What to do with the original message once the invocation completes.
#[derive(Clone, Default)]
pub enum RetryDirective {
    #[default]
    None,
    AsIs,
    Update(MessageUpdate),
}

/// One queued emission for a target processor.
#[derive(Debug, Clone)]
pub struct Emission {
    /// `None` means "the configured next processor"; `Some(id)` a direct
    /// target (used by `send_message` and `emit_retry_message`).
    pub target: Option<String>,
    pub payload: Message,
    pub start_in: Option<Duration>,
    pub priority: Option<i64>,
}

/// One queued event fan-out.
#[derive(Debug, Clone)]
pub struct EventEmission {
    pub event: String,
    pub processor: Option<String>,
    pub payload: Message,
    pub apply_filters: bool,
}

/// One queued scheduler mutation.
#[derive(Debug, Clone)]
pub enum SchedulerOp {
    Add {
        scheduler_id: Option<String>,
        target: Option<String>,
        payload: Message,
        start_time: Option<Duration>,
        period: Option<Duration>,
    },
    Stop { scheduler_id: Option<String> },
}

/// The accumulating response for one processor invocation.
pub struct ResponseHandler {
    message: Mutex<Message>,
    retry: Mutex<RetryDirective>,
    emissions: Mutex<Vec<Emission>>,
    events: Mutex<Vec<EventEmission>>,
    scheduler_ops: Mutex<Vec<SchedulerOp>>,
    filters: Mutex<Vec<Arc<MessageFilter>>>,
    properties: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Default for ResponseHandler {
    fn default() -> Self {
        Self {
            message: Mutex::new(Message::new()),
            retry: Mutex::new(RetryDirective::None),
            emissions: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            scheduler_ops: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            properties: Mutex::new(HashMap::new()),
        }
    }
}

impl ResponseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field on the accumulating output message, eventually emitted
    /// as one downstream message to the configured next processor if
    /// non-empty at flush time.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.message.lock().unwrap().set(key, value);
    }

    pub fn message_is_empty(&self) -> bool {
        self.message.lock().unwrap().is_empty()
    }

    /// `retry_message = true`: re-enqueue the original message unchanged.
    pub fn retry_message(&self) {
        *self.retry.lock().unwrap() = RetryDirective::AsIs;
    }

    /// `retry_message = <update>`: re-enqueue the original merged with the
    /// given tombstones/overrides.
    pub fn retry_message_with(&self, update: MessageUpdate) {
        *self.retry.lock().unwrap() = RetryDirective::Update(update);
    }

    /// Emits `payload` to the configured next processor, unless a filter
    /// drops it (§4.3: a filter returning `None` drops the message rather
    /// than delivering it downstream as an empty payload).
    pub fn emit_message(
        &self,
        payload: Message,
        start_in: Option<Duration>,
        priority: Option<i64>,
    ) {
        let Some(payload) = self.apply_filters(payload) else {
            return;
        };
        self.emissions.lock().unwrap().push(Emission {
            target: None,
            payload,
            start_in,
            priority,
        });
    }

    /// Re-enqueues `payload` for the same processor this invocation is
    /// running under.
    pub fn emit_retry_message(&self, payload: Message, start_in: Option<Duration>) {
        let Some(payload) = self.apply_filters(payload) else {
            return;
        };
        self.emissions.lock().unwrap().push(Emission {
            target: Some("__self__".to_string()),
            payload,
            start_in,
            priority: None,
        });
    }

    pub fn send_message(
        &self,
        processor_id: impl Into<String>,
        payload: Message,
        start_in: Option<Duration>,
        priority: Option<i64>,
    ) {
        let Some(payload) = self.apply_filters(payload) else {
            return;
        };
        self.emissions.lock().unwrap().push(Emission {
            target: Some(processor_id.into()),
            payload,
            start_in,
            priority,
        });
    }

    pub fn send_event(
        &self,
        event: impl Into<String>,
        processor: Option<String>,
        payload: Message,
        apply_filters: bool,
    ) {
        let payload = if apply_filters {
            match self.apply_filters(payload) {
                Some(p) => p,
                None => return,
            }
        } else {
            payload
        };
        self.events.lock().unwrap().push(EventEmission {
            event: event.into(),
            processor,
            payload,
            apply_filters,
        });
    }

    pub fn schedule_message(
        &self,
        payload: Message,
        scheduler_id: Option<String>,
        target: Option<String>,
        start_time: Option<Duration>,
        period: Option<Duration>,
    ) {
        self.scheduler_ops.lock().unwrap().push(SchedulerOp::Add {
            scheduler_id,
            target,
            payload,
            start_time,
            period,
        });
    }

    pub fn stop_scheduler(&self, scheduler_id: Option<String>) {
        self.scheduler_ops
            .lock()
            .unwrap()
            .push(SchedulerOp::Stop { scheduler_id });
    }

    /// Filters apply in reverse registration order (§4.3): the
    /// most-recently-added filter runs first.
    pub fn add_message_filter(&self, filter: Arc<MessageFilter>) {
        self.filters.lock().unwrap().push(filter);
    }

    pub fn remove_message_filter(&self, filter: &Arc<MessageFilter>) {
        self.filters
            .lock()
            .unwrap()
            .retain(|f| !Arc::ptr_eq(f, filter));
    }

    /// Runs every filter, most-recently-added first. `None` from any filter
    /// short-circuits the chain and means "drop this emission entirely".
    fn apply_filters(&self, mut payload: Message) -> Option<Message> {
        for filter in self.filters.lock().unwrap().iter().rev() {
            payload = filter(payload)?;
        }
        Some(payload)
    }

    pub fn set_property<T: Any + Send + Sync>(&self, name: impl Into<String>, value: Arc<T>) {
        self.properties.lock().unwrap().insert(name.into(), value);
    }

    pub fn get_property<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.properties
            .lock()
            .unwrap()
            .get(name)
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    /// Drains everything accumulated so far; called exactly once by the
    /// engine at flush time (§4.3).
    pub fn drain(&self) -> ResponseOutput {
        ResponseOutput {
            message: std::mem::take(&mut *self.message.lock().unwrap()),
            retry: std::mem::take(&mut *self.retry.lock().unwrap()),
            emissions: std::mem::take(&mut *self.emissions.lock().unwrap()),
            events: std::mem::take(&mut *self.events.lock().unwrap()),
            scheduler_ops: std::mem::take(&mut *self.scheduler_ops.lock().unwrap()),
        }
    }
}

/// What the engine actually acts on after a processor invocation returns.
pub struct ResponseOutput {
    pub message: Message,
    pub retry: RetryDirective,
    pub emissions: Vec<Emission>,
    pub events: Vec<EventEmission>,
    pub scheduler_ops: Vec<SchedulerOp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_produces_no_emission_and_as_is_retry_is_preserved() {
        let response = ResponseHandler::new();
        response.retry_message();
        assert!(response.message_is_empty());
        let output = response.drain();
        assert!(matches!(output.retry, RetryDirective::AsIs));
    }

    #[test]
    fn filters_apply_in_reverse_registration_order() {
        let response = ResponseHandler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = order.clone();
        response.add_message_filter(Arc::new(move |m: Message| {
            order_a.lock().unwrap().push("a");
            Some(m)
        }));
        let order_b = order.clone();
        response.add_message_filter(Arc::new(move |m: Message| {
            order_b.lock().unwrap().push("b");
            Some(m)
        }));
        response.emit_message(Message::new(), None, None);
        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn a_filter_returning_none_drops_the_emission_entirely() {
        let response = ResponseHandler::new();
        response.add_message_filter(Arc::new(|_: Message| None));
        let mut payload = Message::new();
        payload.set("a", 1);
        response.emit_message(payload, None, None);
        let output = response.drain();
        assert!(output.emissions.is_empty(), "a dropped emission must not be enqueued at all");
    }
}
