//! `Metrics`: the engine's sole telemetry egress point (§6). The reference
//! implementation forwards everything to `tracing`, matching this
//! codebase's convention of routing observability through one structured
//! logging pipeline rather than a bespoke metrics client.

use std::collections::HashMap;

use async_trait::async_trait;

#[async_trait]
pub trait Metrics: Send + Sync {
    async fn annotation(&self, msg: &str, tags: Option<&HashMap<String, String>>);
    async fn timing(&self, name: &str, ms: f64, tags: Option<&HashMap<String, String>>);
    async fn gauge(&self, name: &str, value: f64, tags: Option<&HashMap<String, String>>);
    async fn increment(&self, name: &str, value: i64, tags: Option<&HashMap<String, String>>);
}

#[derive(Default)]
pub struct LogMetrics;

impl LogMetrics {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Metrics for LogMetrics {
    async fn annotation(&self, msg: &str, tags: Option<&HashMap<String, String>>) {
        tracing::info!(tags = ?tags, "{msg}");
    }

    async fn timing(&self, name: &str, ms: f64, tags: Option<&HashMap<String, String>>) {
        tracing::debug!(metric = name, ms, tags = ?tags, "timing");
    }

    async fn gauge(&self, name: &str, value: f64, tags: Option<&HashMap<String, String>>) {
        tracing::debug!(metric = name, value, tags = ?tags, "gauge");
    }

    async fn increment(&self, name: &str, value: i64, tags: Option<&HashMap<String, String>>) {
        tracing::debug!(metric = name, value, tags = ?tags, "increment");
    }
}
