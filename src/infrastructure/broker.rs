//! Broker-backed infrastructure (§4.7, §5): one task per processor message,
//! schedulers implemented as self-rescheduling tasks with token-based
//! invalidation. No concrete message-broker transport is in scope; `Broker`
//! is the seam a real queue (Redis, RabbitMQ, ...) would implement, and
//! [`InMemoryBroker`] is the reference transport standing in for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::{dispatch, EngineServices};
use crate::error::EngineError;
use crate::message::Message;
use crate::program::Program;
use crate::response::SchedulerOp;
use crate::service::key;

use super::{Infrastructure, SchedulerInfo, EVENT_START, EVENT_STOP};

const SCHEDULER_POLL_CAP: Duration = Duration::from_secs(300);
const SCHEDULER_DUE_SLACK: Duration = Duration::from_secs(3);

/// A unit of work a [`Broker`] carries between enqueue and delivery.
#[derive(Clone)]
pub enum BrokerTask {
    Dispatch {
        program_id: String,
        processor_id: String,
        payload: Message,
    },
    Scheduler {
        program_id: String,
        scheduler_id: String,
        token: Uuid,
        target: String,
        payload: Message,
        wait: Duration,
        period: Option<Duration>,
    },
}

pub type TaskHandler = Arc<dyn Fn(BrokerTask) -> BoxFuture<'static, ()> + Send + Sync>;

/// The transport seam: submit a task, optionally delayed, for later
/// delivery to whatever handler was registered via [`Broker::set_handler`].
#[async_trait]
pub trait Broker: Send + Sync {
    fn set_handler(&self, handler: TaskHandler);
    async fn enqueue(&self, task: BrokerTask, delay: Option<Duration>);
}

/// Reference transport: an in-process delayed-delivery queue. A real
/// deployment swaps this for a client of an actual broker; the
/// `BrokerInfrastructure` above it doesn't change.
#[derive(Default)]
pub struct InMemoryBroker {
    handler: Mutex<Option<TaskHandler>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn set_handler(&self, handler: TaskHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn enqueue(&self, task: BrokerTask, delay: Option<Duration>) {
        let handler = self.handler.lock().clone();
        let Some(handler) = handler else { return };
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            handler(task).await;
        });
    }
}

struct ProgramState {
    program: Arc<Program>,
    scheduler_tokens: HashMap<String, Uuid>,
}

type Programs = Arc<Mutex<HashMap<String, ProgramState>>>;

pub struct BrokerInfrastructure {
    services: EngineServices,
    programs: Programs,
    broker: Arc<dyn Broker>,
}

impl BrokerInfrastructure {
    pub fn new(services: EngineServices, broker: Arc<dyn Broker>) -> Self {
        let programs: Programs = Arc::new(Mutex::new(HashMap::new()));

        let handler_services = services.clone();
        let handler_programs = programs.clone();
        let handler_broker = broker.clone();
        broker.set_handler(Arc::new(move |task| {
            let services = handler_services.clone();
            let programs = handler_programs.clone();
            let broker = handler_broker.clone();
            Box::pin(async move {
                handle_task(&services, &programs, &broker, task).await;
            })
        }));

        Self {
            services,
            programs,
            broker,
        }
    }

    fn liveness_key(program_id: &str) -> String {
        key(&["program_lock", "started", program_id])
    }

    fn trigger_key(program_id: &str, scheduler_id: &str) -> String {
        key(&["scheduler_trigger", program_id, scheduler_id])
    }
}

async fn handle_task(services: &EngineServices, programs: &Programs, broker: &Arc<dyn Broker>, task: BrokerTask) {
    match task {
        BrokerTask::Dispatch {
            program_id,
            processor_id,
            payload,
        } => {
            let Some(program) = programs.lock().get(&program_id).map(|s| s.program.clone()) else {
                return;
            };
            match dispatch(&program, "broker", &processor_id, payload, services).await {
                Ok(outcome) => route_outcome(services, programs, broker, &program, &processor_id, outcome).await,
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, program_id, processor_id, "fatal dispatch error, moving to side channel");
                }
                Err(e) => {
                    tracing::warn!(error = %e, program_id, processor_id, "dispatch error on broker task");
                }
            }
        }
        BrokerTask::Scheduler {
            program_id,
            scheduler_id,
            token,
            target,
            payload,
            wait,
            period,
        } => {
            let Some(program) = programs.lock().get(&program_id).map(|s| s.program.clone()) else {
                return;
            };
            let current_token = programs
                .lock()
                .get(&program_id)
                .and_then(|s| s.scheduler_tokens.get(&scheduler_id).copied());
            if current_token != Some(token) {
                return;
            }

            let trigger_key = BrokerInfrastructure::trigger_key(&program_id, &scheduler_id);
            let triggered = matches!(
                services.lock.get(&trigger_key).await,
                crate::service::LockState::Present | crate::service::LockState::RemainingSeconds(_)
            );
            if triggered {
                services.lock.release(&trigger_key).await;
            } else if wait > SCHEDULER_DUE_SLACK {
                let next_wait = wait.saturating_sub(SCHEDULER_POLL_CAP).max(Duration::ZERO);
                let tick = wait.min(SCHEDULER_POLL_CAP);
                broker
                    .enqueue(
                        BrokerTask::Scheduler {
                            program_id,
                            scheduler_id,
                            token,
                            target,
                            payload,
                            wait: next_wait,
                            period,
                        },
                        Some(tick),
                    )
                    .await;
                return;
            }

            let dispatch_program = program.clone();
            if let Ok(outcome) = dispatch(&dispatch_program, "broker", &target, payload.clone(), services).await {
                route_outcome(services, programs, broker, &dispatch_program, &target, outcome).await;
            }

            if let Some(period) = period {
                broker
                    .enqueue(
                        BrokerTask::Scheduler {
                            program_id,
                            scheduler_id,
                            token,
                            target,
                            payload,
                            wait: period,
                            period: Some(period),
                        },
                        Some(period),
                    )
                    .await;
            }
        }
    }
}

fn route_outcome<'a>(
    services: &'a EngineServices,
    programs: &'a Programs,
    broker: &'a Arc<dyn Broker>,
    program: &'a Arc<Program>,
    processor_id: &'a str,
    outcome: crate::engine::DispatchOutcome,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        for emission in outcome.emissions {
            let target = match emission.target.as_deref() {
                None => program.next_processor_id(processor_id).map(str::to_string),
                Some("__self__") => Some(processor_id.to_string()),
                Some(id) => Some(id.to_string()),
            };
            let Some(target) = target else { continue };
            broker
                .enqueue(
                    BrokerTask::Dispatch {
                        program_id: program.id.clone(),
                        processor_id: target,
                        payload: emission.payload,
                    },
                    emission.start_in,
                )
                .await;
        }

        for event in outcome.events {
            let listeners: Vec<String> = match &event.processor {
                Some(id) => vec![id.clone()],
                None => program.processors_for_event(&event.event).to_vec(),
            };
            for listener in listeners {
                broker
                    .enqueue(
                        BrokerTask::Dispatch {
                            program_id: program.id.clone(),
                            processor_id: listener,
                            payload: event.payload.clone(),
                        },
                        None,
                    )
                    .await;
            }
        }

        for op in outcome.scheduler_ops {
            add_scheduler(services, programs, broker, program, processor_id, op).await;
        }
    })
}

async fn add_scheduler(
    _services: &EngineServices,
    programs: &Programs,
    broker: &Arc<dyn Broker>,
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
            let Some(target) = target.or_else(|| program.next_processor_id(processor_id).map(str::to_string))
            else {
                return;
            };
            let token = Uuid::new_v4();

            {
                let mut programs = programs.lock();
                if let Some(state) = programs.get_mut(&program.id) {
                    state.scheduler_tokens.insert(scheduler_id.clone(), token);
                } else {
                    return;
                }
            }

            broker
                .enqueue(
                    BrokerTask::Scheduler {
                        program_id: program.id.clone(),
                        scheduler_id,
                        token,
                        target,
                        payload,
                        wait: start_time.unwrap_or(Duration::ZERO),
                        period,
                    },
                    start_time,
                )
                .await;
        }
        SchedulerOp::Stop { scheduler_id } => {
            if let Some(id) = scheduler_id {
                let mut programs = programs.lock();
                if let Some(state) = programs.get_mut(&program.id) {
                    state.scheduler_tokens.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl Infrastructure for BrokerInfrastructure {
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
            ProgramState {
                program: program.clone(),
                scheduler_tokens: HashMap::new(),
            },
        );

        for listener in program.processors_for_event(EVENT_START).to_vec() {
            self.broker
                .enqueue(
                    BrokerTask::Dispatch {
                        program_id: program_id.clone(),
                        processor_id: listener,
                        payload: Message::new(),
                    },
                    None,
                )
                .await;
        }
        Ok(())
    }

    async fn stop(&self, program_id: &str) -> Result<(), EngineError> {
        self.services.lock.release(&Self::liveness_key(program_id)).await;

        let state = self.programs.lock().remove(program_id);
        let Some(state) = state else {
            return Err(EngineError::Fatal(format!("program {program_id:?} is not started")));
        };

        for listener in state.program.processors_for_event(EVENT_STOP).to_vec() {
            self.broker
                .enqueue(
                    BrokerTask::Dispatch {
                        program_id: program_id.to_string(),
                        processor_id: listener,
                        payload: Message::new(),
                    },
                    None,
                )
                .await;
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
            .map(|s| s.program.clone())
            .ok_or_else(|| EngineError::Fatal(format!("program {program_id:?} is not started")))?;
        for listener in program.processors_for_event(event).to_vec() {
            self.broker
                .enqueue(
                    BrokerTask::Dispatch {
                        program_id: program_id.to_string(),
                        processor_id: listener,
                        payload: payload.clone(),
                    },
                    None,
                )
                .await;
        }
        Ok(())
    }

    async fn send_message(
        &self,
        program_id: &str,
        processor_id: &str,
        payload: Message,
    ) -> Result<(), EngineError> {
        if !self.programs.lock().contains_key(program_id) {
            return Err(EngineError::Fatal(format!("program {program_id:?} is not started")));
        }
        self.broker
            .enqueue(
                BrokerTask::Dispatch {
                    program_id: program_id.to_string(),
                    processor_id: processor_id.to_string(),
                    payload,
                },
                None,
            )
            .await;
        Ok(())
    }

    fn schedulers(&self, program_id: &str) -> Vec<SchedulerInfo> {
        self.programs
            .lock()
            .get(program_id)
            .map(|s| {
                s.scheduler_tokens
                    .keys()
                    .map(|id| SchedulerInfo {
                        scheduler_id: id.clone(),
                        target: None,
                        period: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn trigger_scheduler(
        &self,
        program_id: &str,
        scheduler_id: &str,
    ) -> Result<(), EngineError> {
        if !self.programs.lock().contains_key(program_id) {
            return Err(EngineError::Fatal(format!("program {program_id:?} is not started")));
        }
        self.services
            .lock
            .set(&Self::trigger_key(program_id, scheduler_id), Some(Duration::from_secs(60)))
            .await;
        Ok(())
    }

    async fn terminate_scheduler(
        &self,
        program_id: &str,
        scheduler_id: &str,
    ) -> Result<(), EngineError> {
        let mut programs = self.programs.lock();
        let state = programs
            .get_mut(program_id)
            .ok_or_else(|| EngineError::Fatal(format!("program {program_id:?} is not started")))?;
        match state.scheduler_tokens.remove(scheduler_id) {
            Some(_) => Ok(()),
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
    async fn send_message_requires_a_started_program() {
        let infra = BrokerInfrastructure::new(services(), Arc::new(InMemoryBroker::new()));
        assert!(infra.send_message("prog", "step", Message::new()).await.is_err());

        let step = Processor::from_fn("step", |_ctx, _response| async { Ok(()) });
        let program = ProgramBuilder::new("prog").pipeline(step.into()).build();
        infra.start(program).await.unwrap();
        assert!(infra.send_message("prog", "step", Message::new()).await.is_ok());
    }

    #[tokio::test]
    async fn stopping_an_unstarted_program_is_an_error() {
        let infra = BrokerInfrastructure::new(services(), Arc::new(InMemoryBroker::new()));
        assert!(infra.stop("prog").await.is_err());
    }
}
