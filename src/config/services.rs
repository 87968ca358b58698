//! Backend selection for each service contract (§6). Only the in-memory
//! reference backends are actually wired up; a named remote backend is
//! accepted here as a forward-declared config hook but rejected at startup
//! until a concrete client is implemented, rather than silently falling back
//! to memory.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendKind {
    Memory,
    Remote(String),
}

impl BackendKind {
    fn parse(s: Option<&str>) -> Self {
        match s {
            None | Some("memory") => BackendKind::Memory,
            Some(other) => BackendKind::Remote(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceBackends {
    pub storage: BackendKind,
    pub cache: BackendKind,
    pub lock: BackendKind,
    pub counter: BackendKind,
    pub rate_counter: BackendKind,
    pub metrics: BackendKind,
}

impl Default for ServiceBackends {
    fn default() -> Self {
        Self {
            storage: BackendKind::Memory,
            cache: BackendKind::Memory,
            lock: BackendKind::Memory,
            counter: BackendKind::Memory,
            rate_counter: BackendKind::Memory,
            metrics: BackendKind::Memory,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileServiceBackends {
    pub storage: Option<String>,
    pub cache: Option<String>,
    pub lock: Option<String>,
    pub counter: Option<String>,
    pub rate_counter: Option<String>,
    pub metrics: Option<String>,
}

impl ServiceBackends {
    pub fn from_file(file: Option<FileServiceBackends>) -> Self {
        let Some(file) = file else { return Self::default() };
        Self {
            storage: BackendKind::parse(file.storage.as_deref()),
            cache: BackendKind::parse(file.cache.as_deref()),
            lock: BackendKind::parse(file.lock.as_deref()),
            counter: BackendKind::parse(file.counter.as_deref()),
            rate_counter: BackendKind::parse(file.rate_counter.as_deref()),
            metrics: BackendKind::parse(file.metrics.as_deref()),
        }
    }

    /// Fails fast (§3: a broken config should fail fast, not silently
    /// degrade) if any service names a backend this build has no client for.
    pub fn validate(&self) -> Result<(), String> {
        for (name, kind) in [
            ("storage", &self.storage),
            ("cache", &self.cache),
            ("lock", &self.lock),
            ("counter", &self.counter),
            ("rate_counter", &self.rate_counter),
            ("metrics", &self.metrics),
        ] {
            if let BackendKind::Remote(backend) = kind {
                return Err(format!(
                    "service {name:?} requests backend {backend:?}, but only \"memory\" is built in"
                ));
            }
        }
        Ok(())
    }
}
