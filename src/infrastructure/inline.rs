//! In-line reference infrastructure (§5): single-caller, recursive
//! dispatch with no queue in front of it. `send_message` recurses directly
//! into the dispatch loop; schedulers are plain `tokio::spawn` loops.
//! Intended for tests and low-throughput deployments, not for anything that
//! needs to survive a process restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{dispatch, EngineServices};
use crate::error::EngineError;
use crate::message::Message;
use crate::program::Program;
use crate::response::SchedulerOp;
use crate::service::key;

use super::{Infrastructure, SchedulerInfo, EVENT_START, EVENT_STOP};

struct SchedulerHandle {
    info: SchedulerInfo,
    task: JoinHandle<()>,
}

struct ProgramEntry {
    program: Arc<Program>,
    schedulers: HashMap<String, SchedulerHandle>,
}

type Programs = Arc<Mutex<HashMap<String, ProgramEntry>>>;

pub struct InlineInfrastructure {
    services: EngineServices,
    programs: Programs,
}

impl InlineInfrastructure {
    pub fn new(services: EngineServices) -> Self {
        Self {
            services,
            programs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn liveness_key(program_id: &str) -> String {
        key(&["program_lock", "started", program_id])
    }
}

#[async_trait]
impl Infrastructure for InlineInfrastructure {
    async fn start(&self, program: Program) -> Result<(), EngineError> {
        let program_id = program.id.clone();
        if !self
            .services
            .lock
            .acquire(&Self::liveness_key(&program_id), None)
            .await
        {
            return Err(EngineError::Fatal(format!(
                "program {program_id:?} is already started"
            )));
        }

        let program = Arc::new(program);
        self.programs.lock().insert(
            program_id.clone(),
            ProgramEntry {
                program: program.clone(),
                schedulers: HashMap::new(),
            },
        );

        for listener in program.processors_for_event(EVENT_START).to_vec() {
            process_message(&self.services, &self.programs, &program, &listener, Message::new())
                .await?;
        }
        Ok(())
    }

    async fn stop(&self, program_id: &str) -> Result<(), EngineError> {
        self.services.lock.release(&Self::liveness_key(program_id)).await;

        let entry = self.programs.lock().remove(program_id);
        let Some(entry) = entry else {
            return Err(EngineError::Fatal(format!("program {program_id:?} is not started")));
        };
        for (_, handle) in entry.schedulers {
            handle.task.abort();
        }

        for listener in entry.program.processors_for_event(EVENT_STOP).to_vec() {
            process_message(&self.services, &self.programs, &entry.program, &listener, Message::new())
                .await?;
        }
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        self.programs.lock().keys().cloned().collect()
    }

    async fn send_event(
        &self,
        program_id: &str,
        event: &str,
        payload: Message,
    ) -> Result<(), EngineError> {
        let program = self
            .programs
            .lock()
            .get(program_id)
            .map(|entry| entry.program.clone())
            .ok_or_else(|| EngineError::Fatal(format!("program {program_id:?} is not started")))?;
        for listener in program.processors_for_event(event).to_vec() {
            process_message(&self.services, &self.programs, &program, &listener, payload.clone())
                .await?;
        }
        Ok(())
    }

    async fn send_message(
        &self,
        program_id: &str,
        processor_id: &str,
        payload: Message,
    ) -> Result<(), EngineError> {
        let program = self
            .programs
            .lock()
            .get(program_id)
            .map(|entry| entry.program.clone())
            .ok_or_else(|| EngineError::Fatal(format!("program {program_id:?} is not started")))?;
        process_message(&self.services, &self.programs, &program, processor_id, payload).await
    }

    fn schedulers(&self, program_id: &str) -> Vec<SchedulerInfo> {
        self.programs
            .lock()
            .get(program_id)
            .map(|entry| entry.schedulers.values().map(|h| h.info.clone()).collect())
            .unwrap_or_default()
    }

    async fn trigger_scheduler(
        &self,
        program_id: &str,
        scheduler_id: &str,
    ) -> Result<(), EngineError> {
        let (program, target) = {
            let programs = self.programs.lock();
            let entry = programs
                .get(program_id)
                .ok_or_else(|| EngineError::Fatal(format!("program {program_id:?} is not started")))?;
            let handle = entry
                .schedulers
                .get(scheduler_id)
                .ok_or_else(|| EngineError::Fatal(format!("no scheduler {scheduler_id:?}")))?;
            (entry.program.clone(), handle.info.target.clone())
        };
        let Some(target) = target else {
            return Err(EngineError::Fatal("scheduler has no resolvable target".into()));
        };
        process_message(&self.services, &self.programs, &program, &target, Message::new()).await
    }

    async fn terminate_scheduler(
        &self,
        program_id: &str,
        scheduler_id: &str,
    ) -> Result<(), EngineError> {
        let mut programs = self.programs.lock();
        let entry = programs
            .get_mut(program_id)
            .ok_or_else(|| EngineError::Fatal(format!("program {program_id:?} is not started")))?;
        match entry.schedulers.remove(scheduler_id) {
            Some(handle) => {
                handle.task.abort();
                Ok(())
            }
            None => Err(EngineError::Fatal(format!("no scheduler {scheduler_id:?}"))),
        }
    }

    fn services(&self) -> &EngineServices {
        &self.services
    }
}

fn process_message<'a>(
    services: &'a EngineServices,
    programs: &'a Programs,
    program: &'a Arc<Program>,
    processor_id: &'a str,
    payload: Message,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        let outcome = dispatch(program, "inline", processor_id, payload, services).await?;

        for emission in outcome.emissions {
            let target = match emission.target.as_deref() {
                None => program.next_processor_id(processor_id).map(str::to_string),
                Some("__self__") => Some(processor_id.to_string()),
                Some(id) => Some(id.to_string()),
            };
            let Some(target) = target else { continue };
            if let Some(delay) = emission.start_in {
                let services = services.clone();
                let programs = programs.clone();
                let program = program.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = process_message(&services, &programs, &program, &target, emission.payload).await;
                });
            } else {
                process_message(services, programs, program, &target, emission.payload).await?;
            }
        }

        for event in outcome.events {
            let listeners: Vec<String> = match &event.processor {
                Some(id) => vec![id.clone()],
                None => program.processors_for_event(&event.event).to_vec(),
            };
            for listener in listeners {
                process_message(services, programs, program, &listener, event.payload.clone()).await?;
            }
        }

        for op in outcome.scheduler_ops {
            apply_scheduler_op(services, programs, program, processor_id, op);
        }

        Ok(())
    })
}

fn apply_scheduler_op(
    services: &EngineServices,
    programs: &Programs,
    program: &Arc<Program>,
    processor_id: &str,
    op: SchedulerOp,
) {
    match op {
        SchedulerOp::Add {
            scheduler_id,
            target,
            payload,
            start_time,
            period,
        } => {
            let scheduler_id = scheduler_id.unwrap_or_else(|| format!("sched-{}", Uuid::new_v4()));
            let resolved_target = target
                .clone()
                .or_else(|| program.next_processor_id(processor_id).map(str::to_string));
            let info = SchedulerInfo {
                scheduler_id: scheduler_id.clone(),
                target: resolved_target.clone(),
                period,
            };

            let services = services.clone();
            let programs_for_task = programs.clone();
            let program_for_task = program.clone();
            let program_id = program.id.clone();
            let task = tokio::spawn(async move {
                let Some(target) = resolved_target else { return };
                if let Some(delay) = start_time {
                    tokio::time::sleep(delay).await;
                }
                loop {
                    let _ = process_message(
                        &services,
                        &programs_for_task,
                        &program_for_task,
                        &target,
                        payload.clone(),
                    )
                    .await;
                    match period {
                        Some(p) => tokio::time::sleep(p).await,
                        None => break,
                    }
                }
            });

            let mut programs = programs.lock();
            if let Some(entry) = programs.get_mut(&program_id) {
                entry.schedulers.insert(scheduler_id, SchedulerHandle { info, task });
            } else {
                task.abort();
            }
        }
        SchedulerOp::Stop { scheduler_id } => {
            if let Some(id) = scheduler_id {
                let mut programs = programs.lock();
                if let Some(entry) = programs.get_mut(&program.id) {
                    if let Some(handle) = entry.schedulers.remove(&id) {
                        handle.task.abort();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn starting_the_same_program_twice_is_rejected() {
        let infra = InlineInfrastructure::new(services());
        let noop = Processor::from_fn("noop", |_ctx, _response| async { Ok(()) });
        let program = || ProgramBuilder::new("prog").pipeline(noop.clone().into()).build();

        infra.start(program()).await.unwrap();
        let err = infra.start(program()).await.unwrap_err();
        assert!(err.is_fatal());

        infra.stop("prog").await.unwrap();
        assert!(infra.start(program()).await.is_ok());
    }

    #[tokio::test]
    async fn send_message_dispatches_through_the_pipeline() {
        let infra = InlineInfrastructure::new(services());
        let step = Processor::from_fn("step", |_ctx, response| async move {
            response.set("seen", true);
            Ok(())
        });
        let program = ProgramBuilder::new("prog").pipeline(step.into()).build();
        infra.start(program).await.unwrap();
        infra
            .send_message("prog", "step", Message::new())
            .await
            .unwrap();
    }
}
