//! A small built-in program used by the default binary run and by the
//! `start`/`send` CLI commands when no user-authored program is wired in.
//! Demonstrates the pieces a real program composes: an event-triggered
//! scheduler, a counted tick, and a logged heartbeat.

use std::time::Duration;

use serde_json::json;

use crate::error::EngineError;
use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::processor::{Processor, Scheduler};
use crate::program::{Program, ProgramBuilder};
use crate::service::{Counter, ServiceHandle};

const TICK_PERIOD: Duration = Duration::from_secs(30);

fn on_start() -> Processor {
    Processor::from_fn("on_start", |_ctx, response| async move {
        tracing::info!("heartbeat program started");
        Scheduler::repeat(response, Message::new(), TICK_PERIOD);
        Ok(())
    })
    .monitor_event("_start")
}

fn heartbeat() -> Processor {
    Processor::from_fn("heartbeat", |ctx, _response| async move {
        let counter = ctx
            .get_service::<ServiceHandle<dyn Counter>>("counter")
            .await
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        let ticks = counter.0.increment("heartbeat.ticks", 1).await;
        tracing::debug!(ticks, "heartbeat tick");
        Ok(())
    })
}

/// A single pipeline: `_start` wakes a repeating scheduler that drives
/// `heartbeat` forever until the program is stopped.
pub fn heartbeat_program() -> Program {
    ProgramBuilder::new("heartbeat")
        .pipeline(Pipeline::single(on_start()))
        .pipeline(Pipeline::single(heartbeat()))
        .build()
}

/// One-shot sample payload for manual `send` invocations.
pub fn sample_payload() -> Message {
    Message::from_value(json!({"source": "cli"}))
}
