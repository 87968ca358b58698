//! The context-manager stack (§4.2): an ordered list of scoped decorations
//! layered around a processor body, each contributing context keys and
//! bracketing enter/exit with outer-priority merge and exception-swallowing
//! unwind semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;

use super::{Context, Slot};

/// What one layer contributes to the child context on a successful enter.
pub type ContextContribution = HashMap<String, Slot>;

/// A single scoped decoration. Guards, cursors, caching, rate limiting,
/// jobs, and `prevent_message_retry` are all implementations of this trait
/// (§4.6).
#[async_trait]
pub trait ContextManager: Send + Sync {
    /// Contributes zero or more context keys visible to inner layers and
    /// the processor body.
    async fn enter(&self, ctx: &Context) -> Result<ContextContribution, EngineError>;

    /// Invoked on unwind, innermost layer first (reverse of enter order).
    /// `error` is the in-flight error offered to this layer; returning
    /// `Ok(true)` swallows it (layers exited afterward, i.e. acquired
    /// *before* this one, see no error). Returning `Err` replaces the
    /// current error.
    async fn exit(
        &self,
        ctx: &Context,
        error: Option<&EngineError>,
    ) -> Result<bool, EngineError> {
        let _ = (ctx, error);
        Ok(false)
    }
}

/// Composes an ordered list of [`ContextManager`]s the way the engine does
/// for program-level then processor-level decorations (§4.4 step 3).
#[derive(Clone, Default)]
pub struct ContextManagerStack {
    layers: Vec<Arc<dyn ContextManager>>,
}

impl ContextManagerStack {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn push(&mut self, layer: Arc<dyn ContextManager>) {
        self.layers.push(layer);
    }

    pub fn extend(&mut self, other: ContextManagerStack) {
        self.layers.extend(other.layers);
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Enters every layer outermost-first (reverse of the push/registration
    /// order is *not* applied here: §4.2 says "opens them in reverse order
    /// (outermost first)" meaning the *last-registered* decoration is the
    /// innermost; callers push decorations in registration order and this
    /// stack treats index 0 as outermost).
    ///
    /// Returns the child context (parent entries plus all contributions,
    /// with an earlier/outer layer's key shadowing the same key contributed
    /// by a later/inner layer — §4.2's outer-priority merge) and an
    /// `Unwind` handle used to run exits in acquisition order with
    /// exception-swallowing semantics.
    pub async fn enter_all(&self, parent: &Context) -> Result<(Context, Unwind), EngineError> {
        let mut child = parent.clone();
        let mut entered = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            match layer.enter(&child).await {
                Ok(contribution) => {
                    if !contribution.is_empty() {
                        child = child.child_with_overrides(contribution);
                    }
                    entered.push(layer.clone());
                }
                Err(e) => {
                    // Unwind what already entered, in acquisition order,
                    // offering this enter-time error.
                    let unwind = Unwind { entered, ctx: child.clone() };
                    let _ = unwind.run(Some(&e)).await;
                    return Err(e);
                }
            }
        }
        Ok((child.clone(), Unwind { entered, ctx: child }))
    }
}

/// Handle returned by [`ContextManagerStack::enter_all`]; closes layers
/// innermost-first (reverse of acquisition order), offering the in-flight
/// error to each in turn — the same order real nested context managers (and
/// this codebase's own `EventPipeline::shutdown`) unwind in.
pub struct Unwind {
    entered: Vec<Arc<dyn ContextManager>>,
    ctx: Context,
}

impl Unwind {
    /// Runs every exit, innermost layer first. `error` is the error the
    /// body raised (if any); a layer may swallow it (layers exited
    /// afterward then see no error) or replace it by itself erroring. Every
    /// entered layer's exit always runs, regardless of an earlier swallow.
    pub async fn run(&self, error: Option<&EngineError>) -> Result<(), EngineError> {
        let mut current: Option<EngineError> = error.map(stringify_clone);
        for layer in self.entered.iter().rev() {
            match layer.exit(&self.ctx, current.as_ref()).await {
                Ok(true) => current = None,
                Ok(false) => {}
                Err(e) => current = Some(e),
            }
        }
        match current {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `EngineError` isn't `Clone` (it wraps `anyhow::Error`); exits only need
/// to observe the error's shape, so unwind carries a lightweight re-creation
/// for the common control-flow variants and falls back to `Fatal` text for
/// opaque ones.
fn stringify_clone(e: &EngineError) -> EngineError {
    match e {
        EngineError::RetryMessage { retry_in } => EngineError::RetryMessage { retry_in: *retry_in },
        EngineError::DropMessage => EngineError::DropMessage,
        EngineError::RateLimitExceeded { retry_in } => {
            EngineError::RateLimitExceeded { retry_in: *retry_in }
        }
        EngineError::QuotaExceeded {
            quota_name,
            quota_key,
            retry_in,
        } => EngineError::QuotaExceeded {
            quota_name: quota_name.clone(),
            quota_key: quota_key.clone(),
            retry_in: *retry_in,
        },
        EngineError::InvalidConfig(s) => EngineError::InvalidConfig(s.clone()),
        EngineError::Extended { message, extra } => EngineError::Extended {
            message: message.clone(),
            extra: extra.clone(),
        },
        EngineError::Fatal(s) => EngineError::Fatal(s.clone()),
        EngineError::Other(e) => EngineError::Fatal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        exits: Arc<std::sync::Mutex<Vec<&'static str>>>,
        swallow: bool,
    }

    #[async_trait]
    impl ContextManager for Recorder {
        async fn enter(&self, _ctx: &Context) -> Result<ContextContribution, EngineError> {
            let mut c = ContextContribution::new();
            c.insert(self.name.to_string(), Slot::Resolved(super::super::ContextValue::json(self.name)));
            Ok(c)
        }

        async fn exit(
            &self,
            _ctx: &Context,
            error: Option<&EngineError>,
        ) -> Result<bool, EngineError> {
            self.exits.lock().unwrap().push(self.name);
            Ok(error.is_some() && self.swallow)
        }
    }

    #[tokio::test]
    async fn exit_runs_innermost_first_and_swallow_clears_outer_layers() {
        let exits = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = ContextManagerStack::new();
        stack.push(Arc::new(Recorder { name: "A", exits: exits.clone(), swallow: false }));
        stack.push(Arc::new(Recorder { name: "B", exits: exits.clone(), swallow: true }));
        stack.push(Arc::new(Recorder { name: "C", exits: exits.clone(), swallow: false }));

        let parent = Context::new();
        let (_child, unwind) = stack.enter_all(&parent).await.unwrap();
        let result = unwind.run(Some(&EngineError::DropMessage)).await;
        assert!(result.is_ok(), "B should have swallowed the error for A");
        // C (innermost) exits first, then B (swallows), then A (sees no error).
        assert_eq!(*exits.lock().unwrap(), vec!["C", "B", "A"]);
        let _ = AtomicUsize::new(0);
    }

    #[tokio::test]
    async fn outer_layer_shadows_inner_layer_for_the_same_key() {
        struct Contributor {
            value: &'static str,
        }

        #[async_trait]
        impl ContextManager for Contributor {
            async fn enter(&self, _ctx: &Context) -> Result<ContextContribution, EngineError> {
                let mut c = ContextContribution::new();
                c.insert("shared".to_string(), Slot::Resolved(super::super::ContextValue::json(self.value)));
                Ok(c)
            }
        }

        let mut stack = ContextManagerStack::new();
        stack.push(Arc::new(Contributor { value: "outer" }));
        stack.push(Arc::new(Contributor { value: "inner" }));

        let parent = Context::new();
        let (child, _unwind) = stack.enter_all(&parent).await.unwrap();
        let seen: String = child.get("shared").await.unwrap();
        assert_eq!(seen, "outer", "outer (first-entered) layer must win over inner");
    }
}
