//! Command-line surface (§6): a thin external caller over the public
//! `Infrastructure` API. Program-level `start|stop|list|event|send`,
//! scheduler `list|trigger|terminate`, cursor `list|get|clear`, job
//! `start|stop|list`. No core dispatch logic lives here; cursor/job
//! subcommands reach `CursorStorage`/`Job` through `infra.services()`
//! rather than through new `Infrastructure` methods, since those are
//! service-backed abstractions, not dispatch operations.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::VERSION;
use crate::demo;
use crate::infrastructure::Infrastructure;
use crate::message::Message;
use crate::service::CursorStorage;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version = VERSION)]
#[command(about = "Async message-driven pipeline processing framework", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the built-in heartbeat program.
    Start,
    /// Stop a started program.
    Stop { program_id: String },
    /// List started programs.
    List,
    /// Broadcast a named event.
    Event {
        program_id: String,
        name: String,
        #[arg(default_value = "{}")]
        payload: String,
    },
    /// Send a message directly to a processor.
    Send {
        program_id: String,
        processor_id: String,
        #[arg(default_value = "{}")]
        payload: String,
    },
    /// Scheduler inspection and control.
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommand,
    },
    /// Cursor inspection (operates on the storage backend directly).
    Cursor {
        #[command(subcommand)]
        command: CursorCommand,
    },
    /// Long-running job control.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
}

#[derive(Subcommand)]
pub enum SchedulerCommand {
    List { program_id: String },
    Trigger { program_id: String, scheduler_id: String },
    Terminate { program_id: String, scheduler_id: String },
}

#[derive(Subcommand)]
pub enum CursorCommand {
    List,
    Get { name: String },
    Clear { name: String },
}

#[derive(Subcommand)]
pub enum JobCommand {
    Start { name: String, #[arg(default_value = "{}")] params: String },
    Stop { job_id: String },
    List { name: String },
}

fn parse_payload(raw: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(raw).context("payload is not valid JSON")?;
    Ok(Message::from_value(value))
}

/// Runs a parsed command against `infra`, which already hosts whatever
/// program the binary wired up (§6: the CLI holds no core logic of its own,
/// so everything here is either a direct `Infrastructure` call or a
/// service-backed lookup through `infra.services()`).
pub async fn run(command: Commands, infra: &dyn Infrastructure) -> Result<()> {
    match command {
        Commands::Start => {
            infra.start(demo::heartbeat_program()).await?;
            println!("started heartbeat");
        }
        Commands::Stop { program_id } => {
            infra.stop(&program_id).await?;
            println!("stopped {program_id}");
        }
        Commands::List => {
            for id in infra.list() {
                println!("{id}");
            }
        }
        Commands::Event { program_id, name, payload } => {
            infra.send_event(&program_id, &name, parse_payload(&payload)?).await?;
            println!("sent event {name:?} to {program_id}");
        }
        Commands::Send {
            program_id,
            processor_id,
            payload,
        } => {
            infra
                .send_message(&program_id, &processor_id, parse_payload(&payload)?)
                .await?;
            println!("sent message to {program_id}/{processor_id}");
        }
        Commands::Scheduler { command } => run_scheduler(command, infra).await?,
        Commands::Cursor { command } => run_cursor(command, infra).await?,
        Commands::Job { command } => run_job(command, infra).await?,
    }
    Ok(())
}

async fn run_scheduler(command: SchedulerCommand, infra: &dyn Infrastructure) -> Result<()> {
    match command {
        SchedulerCommand::List { program_id } => {
            for scheduler in infra.schedulers(&program_id) {
                println!(
                    "{} -> {:?} (period {:?})",
                    scheduler.scheduler_id, scheduler.target, scheduler.period
                );
            }
        }
        SchedulerCommand::Trigger { program_id, scheduler_id } => {
            infra.trigger_scheduler(&program_id, &scheduler_id).await?;
            println!("triggered {scheduler_id}");
        }
        SchedulerCommand::Terminate { program_id, scheduler_id } => {
            infra.terminate_scheduler(&program_id, &scheduler_id).await?;
            println!("terminated {scheduler_id}");
        }
    }
    Ok(())
}

async fn run_cursor(command: CursorCommand, infra: &dyn Infrastructure) -> Result<()> {
    let cursors = CursorStorage::new(infra.services().storage.clone());
    match command {
        CursorCommand::List => {
            for name in cursors.list().await {
                println!("{name}");
            }
        }
        CursorCommand::Get { name } => match cursors.get(&name).await {
            Some(value) => println!("{value}"),
            None => println!("(no cursor named {name:?})"),
        },
        CursorCommand::Clear { name } => {
            cursors.delete(&name).await;
            println!("cleared {name}");
        }
    }
    Ok(())
}

async fn run_job(command: JobCommand, infra: &dyn Infrastructure) -> Result<()> {
    use crate::context::Job;
    use crate::service::{key, CollectionEntry};

    let services = infra.services();
    match command {
        JobCommand::Start { name, params } => {
            let params: Value = serde_json::from_str(&params).context("params is not valid JSON")?;
            let job = Job::new(services.lock.clone(), services.storage.clone(), &name, None);
            let job_id = job.start(params).await;
            println!("{job_id}");
        }
        JobCommand::Stop { job_id } => {
            let name = job_id.split(':').next().unwrap_or_default();
            let job = Job::new(services.lock.clone(), services.storage.clone(), name, None);
            if job.stop(&job_id).await {
                println!("stopped {job_id}");
            } else {
                println!("{job_id} was not running");
            }
        }
        JobCommand::List { name } => {
            let collection = key(&["started_jobs", &name]);
            for entry in services.storage.get_collection(&collection, true).await {
                match entry {
                    CollectionEntry::Id(id) => println!("{id}"),
                    CollectionEntry::Item(item) => println!("{}", item.primary_id),
                }
            }
        }
    }
    Ok(())
}
