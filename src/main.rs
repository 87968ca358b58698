use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pipewright::config::{self, BackendKind, Config, InfrastructureKind};
use pipewright::infrastructure::{
    BrokerInfrastructure, InlineInfrastructure, Infrastructure, WorkerPoolInfrastructure,
};
use pipewright::service::{
    InMemoryBroker, LogMetrics, MemoryCache, MemoryCounter, MemoryLock, MemoryRateCounter, MemoryStorage,
};
use pipewright::{cli, demo, logging, EngineServices};

fn build_services(config: &config::ServiceBackends) -> Result<EngineServices> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))?;

    // `validate()` having passed guarantees every backend is `BackendKind::Memory`.
    debug_assert!(matches!(config.storage, BackendKind::Memory));

    Ok(EngineServices {
        storage: Arc::new(MemoryStorage::new()),
        cache: Arc::new(MemoryCache::new()),
        lock: Arc::new(MemoryLock::new()),
        counter: Arc::new(MemoryCounter::new()),
        rate_counter: Arc::new(MemoryRateCounter::new()),
        metrics: Arc::new(LogMetrics::new()),
    })
}

fn build_infrastructure(kind: &InfrastructureKind, services: EngineServices) -> Arc<dyn Infrastructure> {
    match kind {
        InfrastructureKind::Inline => Arc::new(InlineInfrastructure::new(services)),
        InfrastructureKind::WorkerPool { size } => Arc::new(WorkerPoolInfrastructure::new(services, *size)),
        InfrastructureKind::Broker { .. } => {
            Arc::new(BrokerInfrastructure::new(services, Arc::new(InMemoryBroker::new())))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = Config::from_env();
    let _log_guard = logging::init(&config.logging);

    let services = build_services(&config.services)?;
    let infra = build_infrastructure(&config.infrastructure, services);

    match cli.command {
        Some(command) => cli::run(command, infra.as_ref()).await,
        None => {
            tracing::info!("starting heartbeat program under {:?}", config.infrastructure);
            infra.start(demo::heartbeat_program()).await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            infra.stop("heartbeat").await?;
            Ok(())
        }
    }
}
