//! Infrastructure (§5): the runtime that turns dispatch output into further
//! dispatch calls. `Inline` recurses synchronously on the caller's task;
//! `WorkerPool` fans emissions out onto a bounded in-process task pool;
//! `Broker` layers the token-invalidated scheduler re-enqueue algorithm
//! (§4.7) atop an in-memory queue standing in for a real message broker.
//! All three share [`crate::engine::dispatch`]; they differ only in how
//! they schedule calls into it.

pub mod broker;
pub mod inline;
pub mod worker_pool;

pub use broker::BrokerInfrastructure;
pub use inline::InlineInfrastructure;
pub use worker_pool::WorkerPoolInfrastructure;

use std::time::Duration;

use async_trait::async_trait;

use crate::engine::EngineServices;
use crate::error::EngineError;
use crate::message::Message;
use crate::program::Program;

/// Dispatched when a program starts (§4.7).
pub const EVENT_START: &str = "_start";
/// Dispatched when a program stops.
pub const EVENT_STOP: &str = "_stop";

/// A registered scheduled emission (§4.7): `period` is `None` for a one-shot.
#[derive(Debug, Clone)]
pub struct SchedulerInfo {
    pub scheduler_id: String,
    pub target: Option<String>,
    pub period: Option<Duration>,
}

/// The public surface every CLI command and every processor-triggered
/// scheduler op ultimately reaches through (§6: the CLI holds no core
/// logic of its own).
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Registers `program` and dispatches [`EVENT_START`]; fails if the
    /// program's liveness lock is already held.
    async fn start(&self, program: Program) -> Result<(), EngineError>;

    /// Releases the liveness lock, dispatches [`EVENT_STOP`], and removes
    /// every scheduler the program owns.
    async fn stop(&self, program_id: &str) -> Result<(), EngineError>;

    /// Ids of currently-started programs.
    fn list(&self) -> Vec<String>;

    async fn send_event(
        &self,
        program_id: &str,
        event: &str,
        payload: Message,
    ) -> Result<(), EngineError>;

    async fn send_message(
        &self,
        program_id: &str,
        processor_id: &str,
        payload: Message,
    ) -> Result<(), EngineError>;

    fn schedulers(&self, program_id: &str) -> Vec<SchedulerInfo>;

    /// Fires a scheduler's payload once, immediately, out of band.
    async fn trigger_scheduler(
        &self,
        program_id: &str,
        scheduler_id: &str,
    ) -> Result<(), EngineError>;

    async fn terminate_scheduler(
        &self,
        program_id: &str,
        scheduler_id: &str,
    ) -> Result<(), EngineError>;

    /// The service bundle backing this infrastructure, for collaborators
    /// (the CLI's cursor/job subcommands) that operate on services directly
    /// rather than through program dispatch.
    fn services(&self) -> &EngineServices;
}
