//! In-process fallback queue.
//!
//! Jobs live in an unbounded channel and are processed by a single loop task
//! spawned when the handler is attached, so at most one job is in flight per
//! queue instance and delivery follows submission order. Nothing is
//! persisted: queued and in-flight jobs are lost on restart.

use crate::dead_letter::DeadLetterRecorder;
use crate::error::{ErrorDetail, JobError, JobResult};
use crate::handler::{JobHandler, Progress, ProgressSink};
use crate::job::{JobDescriptor, JobHandle, JobId, JobInfo, JobState, JobType};
use crate::metrics::JobMetrics;
use crate::queue::{JobQueue, QueueMode};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

type JobTable = Arc<RwLock<HashMap<JobId, JobInfo>>>;

/// In-memory FIFO queue with one sequential handler.
pub struct InMemoryQueue {
    job_type: JobType,
    sender: Mutex<Option<mpsc::UnboundedSender<JobDescriptor>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JobDescriptor>>>,
    jobs: JobTable,
    outstanding: Arc<AtomicU64>,
    handler_attached: AtomicBool,
    dead_letter: Option<Arc<DeadLetterRecorder>>,
}

impl InMemoryQueue {
    /// Creates a queue. Failed jobs go to `dead_letter` when one is given.
    pub fn new(job_type: JobType, dead_letter: Option<Arc<DeadLetterRecorder>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            job_type,
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            outstanding: Arc::new(AtomicU64::new(0)),
            handler_attached: AtomicBool::new(false),
            dead_letter,
        }
    }

    /// Returns true once `close` has been called.
    pub fn is_sealed(&self) -> bool {
        self.sender.lock().is_none()
    }

    async fn run(
        job_type: JobType,
        mut receiver: mpsc::UnboundedReceiver<JobDescriptor>,
        handler: JobHandler,
        jobs: JobTable,
        outstanding: Arc<AtomicU64>,
        dead_letter: Option<Arc<DeadLetterRecorder>>,
    ) {
        let queue_name = job_type.queue_name();
        debug!(queue = queue_name, "Local queue loop started");

        while let Some(job) = receiver.recv().await {
            let job_id = job.id.clone();
            if let Some(info) = jobs.write().get_mut(&job_id) {
                info.start();
            }

            let progress = Progress::new(Arc::new(TableProgress {
                jobs: Arc::clone(&jobs),
                job_id: job_id.clone(),
            }));
            let payload = job.payload_value();
            let started = Instant::now();

            let outcome = match AssertUnwindSafe(handler(job, progress)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(JobError::Internal("job handler panicked".to_string())),
            };

            match outcome {
                Ok(result) => {
                    if let Some(info) = jobs.write().get_mut(&job_id) {
                        info.complete(result);
                    }
                    JobMetrics::job_completed(job_type, QueueMode::Local, started.elapsed());
                    debug!(job_id = %job_id, queue = queue_name, "Local job completed");
                }
                Err(e) => {
                    let detail = ErrorDetail::from(&e);
                    if let Some(info) = jobs.write().get_mut(&job_id) {
                        info.fail(detail.clone());
                    }
                    JobMetrics::job_failed(job_type, QueueMode::Local, started.elapsed());
                    error!(job_id = %job_id, queue = queue_name, error = %e, "Local job failed");

                    if let Some(recorder) = &dead_letter {
                        recorder.record(queue_name, &job_id, payload, detail).await;
                    }
                }
            }

            outstanding.fetch_sub(1, Ordering::AcqRel);
        }

        debug!(queue = queue_name, "Local queue drained");
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn mode(&self) -> QueueMode {
        QueueMode::Local
    }

    async fn submit(&self, job: JobDescriptor) -> JobResult<JobHandle> {
        if job.job_type != self.job_type {
            return Err(JobError::Internal(format!(
                "{} job submitted to {} queue",
                job.job_type,
                self.job_type.queue_name()
            )));
        }

        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| JobError::Internal(format!("{} queue is closed", self.job_type.queue_name())))?;

        let handle = JobHandle {
            id: job.id.clone(),
            job_type: job.job_type,
        };

        self.jobs.write().insert(job.id.clone(), JobInfo::waiting(&job));
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        if sender.send(job).is_err() {
            self.jobs.write().remove(&handle.id);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(JobError::Internal("local queue loop is gone".to_string()));
        }

        JobMetrics::job_submitted(self.job_type, QueueMode::Local);
        debug!(job_id = %handle.id, queue = self.job_type.queue_name(), "Job queued locally");

        Ok(handle)
    }

    fn register_handler(&self, handler: JobHandler) -> bool {
        if self.handler_attached.swap(true, Ordering::AcqRel) {
            debug!(queue = self.job_type.queue_name(), "Handler already attached");
            return false;
        }

        let Some(receiver) = self.receiver.lock().take() else {
            return false;
        };

        tokio::spawn(Self::run(
            self.job_type,
            receiver,
            handler,
            Arc::clone(&self.jobs),
            Arc::clone(&self.outstanding),
            self.dead_letter.clone(),
        ));

        info!(queue = self.job_type.queue_name(), "Handler attached to local queue");
        true
    }

    fn has_handler(&self) -> bool {
        self.handler_attached.load(Ordering::Acquire)
    }

    async fn get_job(&self, job_id: &JobId) -> JobResult<Option<JobInfo>> {
        Ok(self.jobs.read().get(job_id).cloned())
    }

    async fn clean(&self, older_than: Duration, state: JobState) -> JobResult<u64> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, info| !info.finished_before(state, threshold));
        Ok((before - jobs.len()) as u64)
    }

    async fn pending(&self) -> JobResult<u64> {
        Ok(self.outstanding.load(Ordering::Acquire))
    }

    /// Seals the queue. Jobs already queued still drain through the
    /// attached handler; the loop exits once the channel is empty.
    async fn close(&self) {
        if self.sender.lock().take().is_some() {
            debug!(queue = self.job_type.queue_name(), "Local queue sealed");
        }
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("job_type", &self.job_type)
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("has_handler", &self.has_handler())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

struct TableProgress {
    jobs: JobTable,
    job_id: JobId,
}

#[async_trait]
impl ProgressSink for TableProgress {
    async fn report(&self, percent: u8) {
        if let Some(info) = self.jobs.write().get_mut(&self.job_id) {
            info.progress = percent;
        }
    }
}
