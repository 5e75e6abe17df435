//! Job queue abstraction.

use crate::dead_letter::DeadLetterRecorder;
use crate::error::{JobError, JobResult};
use crate::handler::JobHandler;
use crate::job::{JobDescriptor, JobHandle, JobId, JobInfo, JobState, JobType};
use crate::memory::InMemoryQueue;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which implementation backs a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Durable queue on the external broker.
    Broker,
    /// In-process fallback queue.
    Local,
}

impl QueueMode {
    /// Short name, as used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            QueueMode::Broker => "broker",
            QueueMode::Local => "local",
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract shared by the broker-backed and in-memory queues.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Job type served by this queue.
    fn job_type(&self) -> JobType;

    /// Implementation backing this queue.
    fn mode(&self) -> QueueMode;

    /// Submit a job. Returns as soon as the job is stored.
    async fn submit(&self, job: JobDescriptor) -> JobResult<JobHandle>;

    /// Attach the processing handler. Only the first handler is honored;
    /// returns false when a handler was already attached.
    fn register_handler(&self, handler: JobHandler) -> bool;

    /// Returns true once a handler is attached.
    fn has_handler(&self) -> bool;

    /// Look up a job.
    async fn get_job(&self, job_id: &JobId) -> JobResult<Option<JobInfo>>;

    /// Remove jobs in `state` that finished more than `older_than` ago.
    async fn clean(&self, older_than: Duration, state: JobState) -> JobResult<u64>;

    /// Number of jobs submitted but not yet finished.
    async fn pending(&self) -> JobResult<u64>;

    /// Stop accepting work and release resources. Best effort.
    async fn close(&self);
}

/// Anything that can route a payload to a queue by name.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Submits `payload` to the queue named `queue_name`.
    async fn submit_to_queue(&self, queue_name: &str, payload: Value) -> JobResult<JobHandle>;
}

/// One queue per job type, all backed by the same implementation.
#[derive(Clone)]
pub struct QueueSet {
    mode: QueueMode,
    queues: BTreeMap<JobType, Arc<dyn JobQueue>>,
}

impl QueueSet {
    /// Builds a set. Every job type must be present and every queue must
    /// report `mode`.
    pub fn new(mode: QueueMode, queues: Vec<Arc<dyn JobQueue>>) -> JobResult<Self> {
        let mut map = BTreeMap::new();
        for queue in queues {
            if queue.mode() != mode {
                return Err(JobError::Internal(format!(
                    "{} queue for {} in a {} set",
                    queue.mode(),
                    queue.job_type(),
                    mode
                )));
            }
            map.insert(queue.job_type(), queue);
        }

        if let Some(missing) = JobType::ALL.into_iter().find(|t| !map.contains_key(t)) {
            return Err(JobError::Internal(format!("No {} queue for {}", mode, missing)));
        }

        Ok(Self { mode, queues: map })
    }

    /// One fresh in-memory queue per job type.
    pub fn local(dead_letter: Option<Arc<DeadLetterRecorder>>) -> Self {
        let queues = JobType::ALL
            .into_iter()
            .map(|job_type| {
                let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new(job_type, dead_letter.clone()));
                (job_type, queue)
            })
            .collect();

        Self {
            mode: QueueMode::Local,
            queues,
        }
    }

    /// Implementation backing every queue in the set.
    #[must_use]
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Queue for `job_type`.
    #[must_use]
    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobQueue>> {
        self.queues.get(&job_type).cloned()
    }

    /// Iterate over all queues.
    pub fn iter(&self) -> impl Iterator<Item = (JobType, &Arc<dyn JobQueue>)> {
        self.queues.iter().map(|(t, q)| (*t, q))
    }

    /// Close every queue concurrently. Errors are logged by the queues
    /// themselves.
    pub async fn close_all(&self) {
        join_all(self.iter().map(|(job_type, queue)| async move {
            queue.close().await;
            debug!(job_type = %job_type, mode = %self.mode, "Closed queue");
        }))
        .await;
    }
}

impl fmt::Debug for QueueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSet")
            .field("mode", &self.mode)
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_queues() -> Vec<Arc<dyn JobQueue>> {
        JobType::ALL
            .into_iter()
            .map(|t| Arc::new(InMemoryQueue::new(t, None)) as Arc<dyn JobQueue>)
            .collect()
    }

    #[test]
    fn test_queue_mode_display() {
        assert_eq!(QueueMode::Broker.to_string(), "broker");
        assert_eq!(QueueMode::Local.to_string(), "local");
    }

    #[tokio::test]
    async fn test_queue_set_requires_every_type() {
        let mut queues = local_queues();
        queues.pop();
        assert!(QueueSet::new(QueueMode::Local, queues).is_err());
    }

    #[tokio::test]
    async fn test_queue_set_rejects_mode_mismatch() {
        assert!(QueueSet::new(QueueMode::Broker, local_queues()).is_err());
    }

    #[tokio::test]
    async fn test_local_set_is_complete() {
        let set = QueueSet::local(None);
        assert_eq!(set.mode(), QueueMode::Local);
        assert_eq!(set.iter().count(), JobType::ALL.len());
    }

    #[tokio::test]
    async fn test_queue_set_lookup() {
        let set = QueueSet::new(QueueMode::Local, local_queues()).unwrap();
        assert_eq!(set.mode(), QueueMode::Local);
        for job_type in JobType::ALL {
            assert_eq!(set.get(job_type).unwrap().job_type(), job_type);
        }
    }
}
