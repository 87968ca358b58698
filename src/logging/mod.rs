//! Tracing subscriber setup: env-filterable level, optional JSON formatting,
//! optional rotating file output (§3's logging ambient stack).

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogRotation, LoggingConfig};

/// Installs the global subscriber. The returned [`WorkerGuard`] must be kept
/// alive for the process lifetime when file logging is enabled, or buffered
/// lines are lost on exit.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if config.file_enabled {
        let rotation = match config.file_rotation {
            LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
            LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
            LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
        };
        let appender = tracing_appender::rolling::RollingFileAppender::new(
            rotation,
            &config.file_dir,
            &config.file_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if config.json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
                .init();
        }
        Some(guard)
    } else if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
        None
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    }
}
