//! Processor: a named unit with a callable body and a set of monitored
//! events (§3). Cloned-on-compose so decorating inside a pipeline never
//! mutates the processor it was built from.

pub mod collection;
pub mod event;
pub mod message;
pub mod scheduler;

pub use collection::{Collection, Items};
pub use event::Event;
pub use scheduler::Scheduler;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{Context, ContextManager, ContextManagerStack};
use crate::error::EngineError;
use crate::response::ResponseHandler;

/// The callable body of a processor.
#[async_trait]
pub trait ProcessorBody: Send + Sync {
    async fn call(&self, ctx: &Context, response: &ResponseHandler) -> Result<(), EngineError>;
}

/// A body built from a plain async closure, the common case for processors
/// defined inline rather than as their own type.
pub struct FnProcessor<F>(pub F);

#[async_trait]
impl<F, Fut> ProcessorBody for FnProcessor<F>
where
    F: Fn(&Context, &ResponseHandler) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EngineError>> + Send,
{
    async fn call(&self, ctx: &Context, response: &ResponseHandler) -> Result<(), EngineError> {
        (self.0)(ctx, response).await
    }
}

/// A named unit the engine dispatches messages to. `id` is the processor's
/// stable identity (§9: fixed, explicit, never derived from a Rust item
/// path) — pipeline composition disambiguates repeated processors by
/// suffixing it (`pipeline.name`, `pipeline.name.2`, …; see `pipeline.rs`).
#[derive(Clone)]
pub struct Processor {
    pub id: String,
    pub monitor_events: HashSet<String>,
    pub context_managers: ContextManagerStack,
    body: Arc<dyn ProcessorBody>,
}

impl Processor {
    pub fn new(id: impl Into<String>, body: impl ProcessorBody + 'static) -> Self {
        Self {
            id: id.into(),
            monitor_events: HashSet::new(),
            context_managers: ContextManagerStack::new(),
            body: Arc::new(body),
        }
    }

    pub fn from_fn<F, Fut>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Context, &ResponseHandler) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        Self::new(id, FnProcessor(body))
    }

    /// Builder: marks this processor as a listener for `event`. Returns a
    /// clone so the source processor (e.g. a shared library definition) is
    /// untouched.
    pub fn monitor_event(&self, event: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.monitor_events.insert(event.into());
        next
    }

    /// Builder: appends a scoped decoration (§4.2), outermost decorations
    /// pushed first.
    pub fn with_context_manager(&self, manager: Arc<dyn ContextManager>) -> Self {
        let mut next = self.clone();
        next.context_managers.push(manager);
        next
    }

    pub async fn call(&self, ctx: &Context, response: &ResponseHandler) -> Result<(), EngineError> {
        self.body.call(ctx, response).await
    }
}

/// A pipeline-composition modifier that mutates the first processor of
/// whatever it's prepended to (`Event::on`, and similar attachments). A
/// thin newtype over a closure rather than a trait, since every known
/// attachment reduces to "take a processor, return a modified one".
#[derive(Clone)]
pub struct Attachment(Arc<dyn Fn(Processor) -> Processor + Send + Sync>);

impl Attachment {
    pub fn new(f: impl Fn(Processor) -> Processor + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, processor: Processor) -> Processor {
        (self.0)(processor)
    }
}
