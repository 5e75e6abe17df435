//! Seam between the queueing core and a concrete broker.

use crate::dead_letter::{DeadLetterRecorder, DeadLetterStore};
use crate::error::JobResult;
use crate::job::JobType;
use crate::monitor::Probe;
use crate::queue::JobQueue;
use crate::status::StatusTracker;
use async_trait::async_trait;
use std::sync::Arc;

/// Collaborators a broker queue reports into.
#[derive(Clone)]
pub struct QueueHooks {
    /// Shared status. Connection-class errors are reported here.
    pub tracker: Arc<StatusTracker>,
    /// Receives terminal job failures.
    pub dead_letter: Option<Arc<DeadLetterRecorder>>,
}

impl std::fmt::Debug for QueueHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHooks")
            .field("tracker", &self.tracker)
            .field("dead_letter", &self.dead_letter.is_some())
            .finish()
    }
}

/// A durable broker able to host job queues and a dead-letter store.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Single liveness round trip on a throwaway connection.
    async fn probe(&self) -> JobResult<()>;

    /// Connects a queue for `job_type`. The returned queue has passed its own
    /// liveness check.
    async fn open_queue(&self, job_type: JobType, hooks: QueueHooks) -> JobResult<Arc<dyn JobQueue>>;

    /// Connects the dead-letter store.
    async fn open_dead_letter_store(&self) -> JobResult<Arc<dyn DeadLetterStore>>;
}

/// Adapts a [`Broker`] to the monitor's [`Probe`].
pub struct BrokerProbe(Arc<dyn Broker>);

impl BrokerProbe {
    /// Wraps `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self(broker)
    }
}

#[async_trait]
impl Probe for BrokerProbe {
    async fn probe(&self) -> JobResult<()> {
        self.0.probe().await
    }
}
