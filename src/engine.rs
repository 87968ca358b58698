//! The dispatch loop (§4.4): builds per-message context, runs a processor
//! through its combined program+processor context-manager stack, handles
//! the `Retry`/`Drop`/fatal error taxonomy, and flushes the response.
//!
//! This is the one piece every [`crate::infrastructure::Infrastructure`]
//! shares; the in-line, worker-pool, and broker-backed runtimes differ only
//! in how they schedule calls into [`dispatch`], not in what dispatch does.

use std::sync::Arc;

use serde_json::Value;

use crate::context::{
    with_resolution_scope, Context, CACHE_RECORDER_KEY, CACHE_REPLAY_KEY, SINGLETON_PROLONG_KEY,
};
use crate::error::EngineError;
use crate::message::Message;
use crate::program::Program;
use crate::response::{Emission, EventEmission, ResponseHandler, RetryDirective, SchedulerOp};
use crate::service::{Cache, Counter, Lock, Metrics, RateCounter, ServiceHandle, Storage};

/// The service bundle every dispatch needs injected into context (§4.4 step
/// 1's "global service map").
#[derive(Clone)]
pub struct EngineServices {
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn Cache>,
    pub lock: Arc<dyn Lock>,
    pub counter: Arc<dyn Counter>,
    pub rate_counter: Arc<dyn RateCounter>,
    pub metrics: Arc<dyn Metrics>,
}

/// What a dispatch produces for the infrastructure to act on: downstream
/// emissions, event fan-out, and scheduler mutations. Fatal and generic
/// (non-retry/drop) errors are returned as `Err` instead — the
/// infrastructure, not the engine, decides whether to retry the task or
/// move it to an error side-channel.
pub struct DispatchOutcome {
    pub emissions: Vec<Emission>,
    pub events: Vec<EventEmission>,
    pub scheduler_ops: Vec<SchedulerOp>,
}

const SELF_TARGET: &str = "__self__";

/// Runs one processor invocation to completion (§4.4). The whole body runs
/// inside a fresh resolution-chain scope so cyclic context factories are
/// caught as a [`crate::error::ContextError::Cycle`] instead of recursing
/// until the stack overflows (§4.1, §8).
pub async fn dispatch(
    program: &Program,
    infrastructure_name: &str,
    processor_id: &str,
    message: Message,
    services: &EngineServices,
) -> Result<DispatchOutcome, EngineError> {
    with_resolution_scope(dispatch_inner(
        program,
        infrastructure_name,
        processor_id,
        message,
        services,
    ))
    .await
}

async fn dispatch_inner(
    program: &Program,
    infrastructure_name: &str,
    processor_id: &str,
    message: Message,
    services: &EngineServices,
) -> Result<DispatchOutcome, EngineError> {
    let processor = program
        .processor(processor_id)
        .ok_or_else(|| EngineError::Fatal(format!("unknown processor {processor_id:?}")))?
        .clone();

    let base_ctx = build_base_context(program, infrastructure_name, processor_id, &message, services).await;
    let response = ResponseHandler::new();

    let mut combined = program.context_managers.clone();
    combined.extend(processor.context_managers.clone());

    let (child_ctx, unwind) = combined.enter_all(&base_ctx).await?;

    let mut body_result: Result<(), EngineError> = Ok(());
    if child_ctx.contains(CACHE_REPLAY_KEY) {
        replay_cached_emissions(&child_ctx, &response).await;
    } else {
        install_cache_recorder(&child_ctx, &response).await;
        install_singleton_prolong(&child_ctx, &response).await;
        body_result = processor.call(&child_ctx, &response).await;
    }

    let unwind_result = unwind.run(body_result.as_ref().err()).await;

    match unwind_result {
        Ok(()) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(EngineError::DropMessage) => {
            tracing::warn!(processor_id, "message dropped");
        }
        Err(e) if e.is_retry() => {
            let retry_in = e.retry_delay();
            tracing::debug!(processor_id, ?retry_in, "retrying message");
            response.emit_retry_message(message.clone(), retry_in);
        }
        Err(e) => return Err(e),
    }

    Ok(flush(response, &message))
}

async fn build_base_context(
    program: &Program,
    infrastructure_name: &str,
    processor_id: &str,
    message: &Message,
    services: &EngineServices,
) -> Context {
    let ctx = Context::new();
    ctx.set_service("storage", Arc::new(ServiceHandle(services.storage.clone())));
    ctx.set_service("cache", Arc::new(ServiceHandle(services.cache.clone())));
    ctx.set_service("lock", Arc::new(ServiceHandle(services.lock.clone())));
    ctx.set_service("counter", Arc::new(ServiceHandle(services.counter.clone())));
    ctx.set_service("rate_counter", Arc::new(ServiceHandle(services.rate_counter.clone())));
    ctx.set_service("metrics", Arc::new(ServiceHandle(services.metrics.clone())));
    ctx.set_json("infrastructure", infrastructure_name);
    ctx.set_json("program", program.name.clone());
    ctx.set_json("program_id", program.id.clone());
    ctx.set_json("processor_id", processor_id);
    ctx.set_json(
        "next_processor_id",
        program
            .next_processor_id(processor_id)
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    let frozen = Arc::new(message.to_frozen_ref());
    ctx.set_service("message", frozen);

    for (context_key, path) in program.message_mapping() {
        if let Some(value) = ctx.get_path(path).await {
            ctx.set_json(context_key.clone(), value);
        }
    }
    ctx
}

async fn replay_cached_emissions(ctx: &Context, response: &ResponseHandler) {
    if let Ok(payloads) = ctx.get::<Vec<Value>>(CACHE_REPLAY_KEY).await {
        for payload in payloads {
            response.emit_message(Message::from_value(payload), None, None);
        }
    }
}

async fn install_cache_recorder(ctx: &Context, response: &ResponseHandler) {
    if let Ok(recorder) = ctx
        .get_service::<crate::context::RecordedEmissions>(CACHE_RECORDER_KEY)
        .await
    {
        response.add_message_filter(Arc::new(move |m: Message| {
            recorder.record(m.to_value());
            Some(m)
        }));
    }
}

async fn install_singleton_prolong(ctx: &Context, response: &ResponseHandler) {
    if let Ok(prolong) = ctx
        .get_service::<crate::context::SingletonProlong>(SINGLETON_PROLONG_KEY)
        .await
    {
        response.add_message_filter(Arc::new(move |m: Message| {
            prolong.prolong();
            Some(m)
        }));
    }
}

fn flush(response: ResponseHandler, original: &Message) -> DispatchOutcome {
    let output = response.drain();
    let mut emissions = output.emissions;

    if !output.message.is_empty() {
        emissions.push(Emission {
            target: None,
            payload: output.message,
            start_in: None,
            priority: None,
        });
    }

    match output.retry {
        RetryDirective::None => {}
        RetryDirective::AsIs => emissions.push(Emission {
            target: Some(SELF_TARGET.to_string()),
            payload: original.clone(),
            start_in: None,
            priority: None,
        }),
        RetryDirective::Update(update) => {
            let merged = update.merge_with_message(&original.to_frozen_ref());
            if !merged.is_empty() {
                emissions.push(Emission {
                    target: Some(SELF_TARGET.to_string()),
                    payload: merged,
                    start_in: None,
                    priority: None,
                });
            }
        }
    }

    DispatchOutcome {
        emissions,
        events: output.events,
        scheduler_ops: output.scheduler_ops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::processor::Processor;
    use crate::program::ProgramBuilder;
    use crate::service::{LogMetrics, MemoryCache, MemoryCounter, MemoryLock, MemoryRateCounter, MemoryStorage};

    fn services() -> EngineServices {
        EngineServices {
            storage: Arc::new(MemoryStorage::new()),
            cache: Arc::new(MemoryCache::new()),
            lock: Arc::new(MemoryLock::new()),
            counter: Arc::new(MemoryCounter::new()),
            rate_counter: Arc::new(MemoryRateCounter::new()),
            metrics: Arc::new(LogMetrics::new()),
        }
    }

    #[tokio::test]
    async fn a_successful_invocation_emits_the_accumulated_message_to_the_next_processor() {
        let emit = Processor::from_fn("emit", |_ctx, response| async move {
            response.set("a", 1);
            Ok(())
        });
        let record = Processor::from_fn("record", |_ctx, _response| async { Ok(()) });
        let program = ProgramBuilder::new("prog")
            .pipeline((emit >> record).named("p"))
            .build();

        let outcome = dispatch(&program, "inline", "p.emit", Message::new(), &services())
            .await
            .unwrap();
        assert_eq!(outcome.emissions.len(), 1);
        assert_eq!(outcome.emissions[0].target, None);
        assert_eq!(outcome.emissions[0].payload.get("a"), Some(&Value::from(1)));
    }

    #[tokio::test]
    async fn a_retry_error_re_enqueues_the_original_for_the_same_processor() {
        let flaky = Processor::from_fn("flaky", |_ctx, _response| async {
            Err(EngineError::retry())
        });
        let program = ProgramBuilder::new("prog")
            .pipeline(Pipeline::single(flaky).named("p"))
            .build();

        let mut message = Message::new();
        message.set("n", 0);
        let outcome = dispatch(&program, "inline", "p.flaky", message, &services())
            .await
            .unwrap();
        assert_eq!(outcome.emissions.len(), 1);
        assert_eq!(outcome.emissions[0].target.as_deref(), Some(SELF_TARGET));
    }

    #[tokio::test]
    async fn a_message_mapping_materializes_a_message_field_into_context() {
        use crate::context::Path;

        let record = Processor::from_fn("record", |ctx, response| async move {
            let user_id: String = ctx.get("user_id").await.map_err(|e| EngineError::Fatal(e.to_string()))?;
            response.set("seen", user_id);
            Ok(())
        });
        let program = ProgramBuilder::new("prog")
            .map_message("user_id", Path::new("message.user_id"))
            .pipeline(Pipeline::single(record).named("p"))
            .build();

        let mut message = Message::new();
        message.set("user_id", "u-1");
        let outcome = dispatch(&program, "inline", "p.record", message, &services())
            .await
            .unwrap();
        assert_eq!(outcome.emissions[0].payload.get("seen"), Some(&Value::from("u-1")));
    }

    #[tokio::test]
    async fn a_fatal_error_propagates_instead_of_being_flushed() {
        let broken = Processor::from_fn("broken", |_ctx, _response| async {
            Err(EngineError::Fatal("invariant violated".into()))
        });
        let program = ProgramBuilder::new("prog")
            .pipeline(Pipeline::single(broken).named("p"))
            .build();

        let err = dispatch(&program, "inline", "p.broken", Message::new(), &services())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
