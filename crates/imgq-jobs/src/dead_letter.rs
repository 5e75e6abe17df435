//! Dead-letter recording for terminally failed jobs.
//!
//! Records go to the broker-backed [`DeadLetterStore`] while one is attached
//! and answers its own liveness check. Otherwise each failure is written as a
//! single JSON file into the audit directory. Recording never fails the
//! caller: the worst case is a logged error.

use crate::broker::Broker;
use crate::error::{ErrorDetail, JobError, JobResult};
use crate::job::JobId;
use crate::metrics::JobMetrics;
use crate::queue::JobSubmitter;
use crate::status::{BrokerStatus, StatusEvent, StatusTracker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgq_config::DeadLetterConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const FILE_PREFIX: &str = "dead-letter-";

/// Durable record of a terminally failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Record ID. Every call to `record` produces a new one.
    pub id: String,
    /// Queue the job was submitted to.
    pub original_queue_name: String,
    /// ID of the failed job.
    pub original_job_id: JobId,
    /// Original payload, verbatim.
    pub payload: Value,
    /// Failure detail.
    pub error: ErrorDetail,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Creates a record with a fresh ID.
    pub fn new(queue_name: &str, job_id: &JobId, payload: Value, error: ErrorDetail) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original_queue_name: queue_name.to_string(),
            original_job_id: job_id.clone(),
            payload,
            error,
            timestamp: Utc::now(),
        }
    }

    /// File name used by the file fallback.
    pub fn file_name(&self) -> String {
        format!(
            "{}{}-{}.json",
            FILE_PREFIX,
            self.timestamp.timestamp_millis(),
            self.id
        )
    }
}

/// Broker-backed dead-letter persistence.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> JobResult<()>;

    /// Persists a record and returns its ID.
    async fn add(&self, record: &DeadLetterRecord) -> JobResult<String>;

    /// Looks a record up.
    async fn get(&self, id: &str) -> JobResult<Option<DeadLetterRecord>>;

    /// Most recent records first.
    async fn list(&self, limit: usize) -> JobResult<Vec<DeadLetterRecord>>;

    /// Deletes all but the `keep` most recent records. Returns the number
    /// removed.
    async fn prune(&self, keep: usize) -> JobResult<u64>;

    /// Releases connections. Best effort.
    async fn close(&self);
}

/// Records terminal failures, to the broker store when possible and to the
/// audit directory otherwise.
pub struct DeadLetterRecorder {
    store: RwLock<Option<Arc<dyn DeadLetterStore>>>,
    broker: Option<Arc<dyn Broker>>,
    directory: PathBuf,
    retention_count: usize,
    ping_timeout: Duration,
}

impl DeadLetterRecorder {
    /// Creates a recorder in file mode. With a broker, `connect` or the
    /// status listener attaches the store later.
    pub fn new(config: &DeadLetterConfig, broker: Option<Arc<dyn Broker>>) -> Self {
        Self {
            store: RwLock::new(None),
            broker,
            directory: config.directory.clone(),
            retention_count: config.retention_count,
            ping_timeout: config.ping_timeout(),
        }
    }

    /// Audit directory used by the file fallback.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Default number of records kept by [`cleanup`](Self::cleanup).
    pub fn retention_count(&self) -> usize {
        self.retention_count
    }

    /// Returns true while a broker store is attached.
    pub fn is_durable(&self) -> bool {
        self.store.read().is_some()
    }

    fn current_store(&self) -> Option<Arc<dyn DeadLetterStore>> {
        self.store.read().clone()
    }

    /// Attaches a store directly.
    pub fn attach_store(&self, store: Arc<dyn DeadLetterStore>) {
        *self.store.write() = Some(store);
    }

    /// Detaches the current store and closes it.
    pub async fn detach_store(&self) {
        let previous = self.store.write().take();
        if let Some(store) = previous {
            store.close().await;
            info!("Dead-letter recorder switched to file fallback");
        }
    }

    /// Opens and checks the broker store. Returns true when attached.
    pub async fn connect(&self) -> bool {
        let Some(broker) = &self.broker else {
            return false;
        };

        if self.is_durable() {
            return true;
        }

        let store = match broker.open_dead_letter_store().await {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "Dead-letter store unavailable, using file fallback");
                return false;
            }
        };

        if let Err(e) = self.ping(store.as_ref()).await {
            warn!(error = %e, "Dead-letter store failed liveness check");
            store.close().await;
            return false;
        }

        self.attach_store(store);
        info!("Dead-letter recorder using broker store");
        true
    }

    /// Applies a status change.
    pub async fn on_status(&self, status: BrokerStatus) {
        match status {
            BrokerStatus::Available => {
                self.connect().await;
            }
            BrokerStatus::Unavailable => self.detach_store().await,
        }
    }

    /// Follows status changes from `tracker` until the channel closes.
    pub fn spawn_status_listener(self: &Arc<Self>, tracker: &Arc<StatusTracker>) -> JoinHandle<()> {
        let recorder = Arc::clone(self);
        let tracker = Arc::clone(tracker);
        let mut events = tracker.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StatusEvent::Changed(status)) => recorder.on_status(status).await,
                    // Checked at use time instead.
                    Ok(StatusEvent::ConnectionError(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Dead-letter status listener lagged");
                        recorder.on_status(tracker.status()).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn ping(&self, store: &dyn DeadLetterStore) -> JobResult<()> {
        match tokio::time::timeout(self.ping_timeout, store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                operation: "dead-letter ping",
                after: self.ping_timeout,
            }),
        }
    }

    /// Records a terminal failure.
    ///
    /// Returns the store record ID, or `None` when the record went to the
    /// file fallback or could not be written at all. Duplicate calls produce
    /// duplicate records.
    pub async fn record(
        &self,
        queue_name: &str,
        job_id: &JobId,
        payload: Value,
        error: ErrorDetail,
    ) -> Option<String> {
        let record = DeadLetterRecord::new(queue_name, job_id, payload, error);

        if let Some(store) = self.current_store() {
            let stored = match self.ping(store.as_ref()).await {
                Ok(()) => store.add(&record).await,
                Err(e) => Err(e),
            };

            match stored {
                Ok(id) => {
                    JobMetrics::job_dead_lettered(queue_name, "store");
                    info!(record_id = %id, job_id = %job_id, queue = queue_name, "Dead-letter record stored");
                    return Some(id);
                }
                Err(e) => {
                    warn!(job_id = %job_id, queue = queue_name, error = %e, "Dead-letter store failed, writing file");
                }
            }
        }

        match self.write_file(&record).await {
            Ok(path) => {
                JobMetrics::job_dead_lettered(queue_name, "file");
                info!(job_id = %job_id, queue = queue_name, path = %path.display(), "Dead-letter record written to file");
            }
            Err(e) => {
                error!(job_id = %job_id, queue = queue_name, error = %e, "Failed to write dead-letter file");
            }
        }

        None
    }

    async fn write_file(&self, record: &DeadLetterRecord) -> JobResult<PathBuf> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.directory.join(record.file_name());
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// Keeps the `retention_count` most recent store records. File mode is a
    /// no-op. Returns the number of records removed.
    pub async fn cleanup(&self, retention_count: usize) -> u64 {
        let Some(store) = self.current_store() else {
            debug!("Dead-letter cleanup skipped in file mode");
            return 0;
        };

        match store.prune(retention_count).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, kept = retention_count, "Pruned dead-letter records");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "Dead-letter cleanup failed");
                0
            }
        }
    }

    /// Looks a record up in the store, then in the audit directory.
    pub async fn get(&self, record_id: &str) -> JobResult<Option<DeadLetterRecord>> {
        if let Some(store) = self.current_store() {
            match store.get(record_id).await {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(e) => warn!(record_id, error = %e, "Dead-letter store lookup failed"),
            }
        }

        Ok(self
            .list_files()
            .await?
            .into_iter()
            .find(|record| record.id == record_id))
    }

    /// Most recent store records first. Empty in file mode.
    pub async fn list(&self, limit: usize) -> JobResult<Vec<DeadLetterRecord>> {
        match self.current_store() {
            Some(store) => store.list(limit).await,
            None => Ok(Vec::new()),
        }
    }

    /// Reads the audit directory back, oldest first. Unreadable files are
    /// skipped.
    pub async fn list_files(&self) -> JobResult<Vec<DeadLetterRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }

            let parsed = tokio::fs::read(entry.path())
                .await
                .map_err(JobError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<DeadLetterRecord>(&bytes)?));

            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %name, error = %e, "Skipping unreadable dead-letter file"),
            }
        }

        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }

    /// Re-submits a record's payload to `target_queue`.
    ///
    /// Returns false when the record is missing, belongs to another queue,
    /// or the submission fails. The record is kept either way.
    pub async fn retry(&self, record_id: &str, target_queue: &str, submitter: &dyn JobSubmitter) -> bool {
        let record = match self.get(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(record_id, "Dead-letter record not found");
                return false;
            }
            Err(e) => {
                warn!(record_id, error = %e, "Dead-letter lookup failed");
                return false;
            }
        };

        if record.original_queue_name != target_queue {
            warn!(
                record_id,
                expected = %record.original_queue_name,
                requested = target_queue,
                "Dead-letter retry queue mismatch"
            );
            return false;
        }

        match submitter.submit_to_queue(target_queue, record.payload).await {
            Ok(handle) => {
                info!(record_id, job_id = %handle.id, queue = target_queue, "Dead-letter record resubmitted");
                true
            }
            Err(e) => {
                warn!(record_id, queue = target_queue, error = %e, "Dead-letter retry failed");
                false
            }
        }
    }

    /// Detaches and closes the store.
    pub async fn close(&self) {
        self.detach_store().await;
    }
}

impl std::fmt::Debug for DeadLetterRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRecorder")
            .field("directory", &self.directory)
            .field("durable", &self.is_durable())
            .field("retention_count", &self.retention_count)
            .finish()
    }
}
