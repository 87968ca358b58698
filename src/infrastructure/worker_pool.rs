//! Worker-pool infrastructure (§5): the same recursive dispatch as
//! [`super::inline`], except every emission is handed to a bounded pool of
//! tasks pulling off one shared queue rather than run on the caller's task.
//! Useful once a single program pushes enough traffic that a slow processor
//! shouldn't stall the ones behind it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{dispatch, EngineServices};
use crate::error::EngineError;
use crate::message::Message;
use crate::program::Program;
use crate::response::SchedulerOp;
use crate::service::key;

use super::{Infrastructure, SchedulerInfo, EVENT_START, EVENT_STOP};

struct WorkItem {
    program: Arc<Program>,
    processor_id: String,
    payload: Message,
}

struct SchedulerHandle {
    info: SchedulerInfo,
    task: JoinHandle<()>,
}

struct ProgramEntry {
    program: Arc<Program>,
    schedulers: HashMap<String, SchedulerHandle>,
}

type Programs = Arc<parking_lot::Mutex<HashMap<String, ProgramEntry>>>;

pub struct WorkerPoolInfrastructure {
    services: EngineServices,
    programs: Programs,
    queue: mpsc::UnboundedSender<WorkItem>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPoolInfrastructure {
    pub fn new(services: EngineServices, size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
        let rx = Arc::new(AsyncMutex::new(rx));
        let programs: Programs = Arc::new(parking_lot::Mutex::new(HashMap::new()));

        let workers = (0..size.max(1))
            .map(|_| {
                let rx = rx.clone();
                let services = services.clone();
                let programs = programs.clone();
                let queue = tx.clone();
                tokio::spawn(async move {
                    loop {
                        let item = { rx.lock().await.recv().await };
                        let Some(item) = item else { break };
                        let outcome = dispatch(
                            &item.program,
                            "worker_pool",
                            &item.processor_id,
                            item.payload,
                            &services,
                        )
                        .await;
                        match outcome {
                            Ok(outcome) => {
                                enqueue_outcome(
                                    &queue,
                                    &programs,
                                    &services,
                                    &item.program,
                                    &item.processor_id,
                                    outcome,
                                );
                            }
                            Err(e) if e.is_fatal() => {
                                tracing::error!(error = %e, "fatal dispatch error in worker pool");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dispatch error in worker pool");
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            services,
            programs,
            queue: tx,
            workers,
        }
    }

    fn liveness_key(program_id: &str) -> String {
        key(&["program_lock", "started", program_id])
    }

    fn enqueue(&self, program: Arc<Program>, processor_id: impl Into<String>, payload: Message) {
        let _ = self.queue.send(WorkItem {
            program,
            processor_id: processor_id.into(),
            payload,
        });
    }
}

impl Drop for WorkerPoolInfrastructure {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn enqueue_outcome(
    queue: &mpsc::UnboundedSender<WorkItem>,
    programs: &Programs,
    services: &EngineServices,
    program: &Arc<Program>,
    processor_id: &str,
    outcome: crate::engine::DispatchOutcome,
) {
    for emission in outcome.emissions {
        let target = match emission.target.as_deref() {
            None => program.next_processor_id(processor_id).map(str::to_string),
            Some("__self__") => Some(processor_id.to_string()),
            Some(id) => Some(id.to_string()),
        };
        let Some(target) = target else { continue };
        if let Some(delay) = emission.start_in {
            let queue = queue.clone();
            let program = program.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = queue.send(WorkItem {
                    program,
                    processor_id: target,
                    payload: emission.payload,
                });
            });
        } else {
            let _ = queue.send(WorkItem {
                program: program.clone(),
                processor_id: target,
                payload: emission.payload,
            });
        }
    }

    for event in outcome.events {
        let listeners: Vec<String> = match &event.processor {
            Some(id) => vec![id.clone()],
            None => program.processors_for_event(&event.event).to_vec(),
        };
        for listener in listeners {
            let _ = queue.send(WorkItem {
                program: program.clone(),
                processor_id: listener,
                payload: event.payload.clone(),
            });
        }
    }

    for op in outcome.scheduler_ops {
        apply_scheduler_op(queue, programs, services, program, processor_id, op);
    }
}

fn apply_scheduler_op(
    queue: &mpsc::UnboundedSender<WorkItem>,
    programs: &Programs,
    services: &EngineServices,
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

            let queue_for_task = queue.clone();
            let program_for_task = program.clone();
            let program_id = program.id.clone();
            let task = tokio::spawn(async move {
                let Some(target) = resolved_target else { return };
                if let Some(delay) = start_time {
                    tokio::time::sleep(delay).await;
                }
                loop {
                    let _ = queue_for_task.send(WorkItem {
                        program: program_for_task.clone(),
                        processor_id: target.clone(),
                        payload: payload.clone(),
                    });
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
    let _ = services;
}

#[async_trait]
impl Infrastructure for WorkerPoolInfrastructure {
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
            program_id,
            ProgramEntry {
                program: program.clone(),
                schedulers: HashMap::new(),
            },
        );

        for listener in program.processors_for_event(EVENT_START).to_vec() {
            self.enqueue(program.clone(), listener, Message::new());
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
            self.enqueue(entry.program.clone(), listener, Message::new());
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
            self.enqueue(program.clone(), listener, payload.clone());
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
        self.enqueue(program, processor_id, payload);
        Ok(())
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
        self.enqueue(program, target, Message::new());
        Ok(())
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
    async fn send_message_is_accepted_once_a_program_is_started() {
        let infra = WorkerPoolInfrastructure::new(services(), 2);
        let step = Processor::from_fn("step", |_ctx, _response| async { Ok(()) });
        let program = ProgramBuilder::new("prog").pipeline(step.into()).build();
        infra.start(program).await.unwrap();
        infra
            .send_message("prog", "step", Message::new())
            .await
            .unwrap();
        assert!(infra.send_message("missing", "step", Message::new()).await.is_err());
    }
}
