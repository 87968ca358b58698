//! Long-running jobs (§4.6): a job is a named activity whose liveness is
//! tracked by a TTL lock; starting one stamps its id onto every downstream
//! message, and a per-processor guard drops messages once the job has died.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::message::{FrozenMessage, JOB_KEY_PREFIX};
use crate::service::{key, Lock, Storage};

use super::manager::{ContextContribution, ContextManager};
use super::Context;

const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(60);

/// Handle for starting and stopping named long-running activities.
pub struct Job {
    lock: Arc<dyn Lock>,
    storage: Arc<dyn Storage>,
    name: String,
    expires_in: Duration,
}

impl Job {
    pub fn new(
        lock: Arc<dyn Lock>,
        storage: Arc<dyn Storage>,
        name: impl Into<String>,
        expires_in: Option<Duration>,
    ) -> Self {
        Self {
            lock,
            storage,
            name: name.into(),
            expires_in: expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        }
    }

    fn lock_key(&self, job_id: &str) -> String {
        key(&["lock", "job", job_id])
    }

    /// Starts a fresh instance of this job, returning the `job_id` to stamp
    /// onto every downstream message under `_job_<name>`.
    pub async fn start(&self, params: Value) -> String {
        let job_id = format!("{}:{}", self.name, Uuid::new_v4());
        self.lock.acquire(&self.lock_key(&job_id), Some(self.expires_in)).await;
        let collection = key(&["started_jobs", &self.name]);
        let _ = self
            .storage
            .save(&job_id, params, &[], std::slice::from_ref(&collection))
            .await;
        job_id
    }

    /// Releases the job's liveness lock; in-flight messages carrying its id
    /// will drop at their next [`JobGuardDecoration`] check.
    pub async fn stop(&self, job_id: &str) -> bool {
        self.lock.release(&self.lock_key(job_id)).await
    }

    /// Message field a `JobGuardDecoration` for this job reads liveness
    /// tokens from.
    pub fn message_key(&self) -> String {
        format!("{}{}", JOB_KEY_PREFIX, self.name)
    }
}

/// Checks job liveness by prolonging the lock named in the arriving
/// message's `_job_<name>` field; drops the message if the job has died or
/// was never started.
pub struct JobGuardDecoration {
    lock: Arc<dyn Lock>,
    message_key: String,
    expires_in: Duration,
}

impl JobGuardDecoration {
    pub fn new(lock: Arc<dyn Lock>, job_name: impl Into<String>, expires_in: Option<Duration>) -> Self {
        Self {
            lock,
            message_key: format!("{}{}", JOB_KEY_PREFIX, job_name.into()),
            expires_in: expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        }
    }
}

#[async_trait]
impl ContextManager for JobGuardDecoration {
    async fn enter(&self, ctx: &Context) -> Result<ContextContribution, EngineError> {
        let message = ctx
            .get_service::<FrozenMessage>("message")
            .await
            .map_err(|_| EngineError::Fatal("job guard requires a message in context".into()))?;
        let job_id = message
            .get(&self.message_key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(EngineError::DropMessage)?;

        let lock_key = key(&["lock", "job", &job_id]);
        if self.lock.prolong(&lock_key, self.expires_in).await {
            Ok(ContextContribution::new())
        } else {
            Err(EngineError::DropMessage)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::service::{MemoryLock, MemoryStorage};

    #[tokio::test]
    async fn job_guard_drops_once_job_dies() {
        let lock: Arc<dyn Lock> = Arc::new(MemoryLock::new());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let job = Job::new(lock.clone(), storage, "ingest", Some(Duration::from_millis(5)));
        let job_id = job.start(Value::Null).await;

        let mut message = Message::new();
        message.set(job.message_key(), job_id.clone());
        let frozen = Arc::new(message.freeze());

        let ctx = Context::new();
        ctx.set_service("message", frozen);

        let guard = JobGuardDecoration::new(lock.clone(), "ingest", Some(Duration::from_secs(60)));
        assert!(guard.enter(&ctx).await.is_ok());

        job.stop(&job_id).await;
        let err = guard.enter(&ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::DropMessage));
    }
}
