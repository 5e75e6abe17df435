//! Redis job queue implementation.
//!
//! Layout per queue: a wait list (LPUSH / BRPOPLPUSH, so FIFO), an active
//! list, a delayed set for retries, completed and failed sets scored by
//! finish time, and one hash per job.
//!
//! Delivery is at least once. Ids left in the active list by a worker that
//! was stopped or lost the broker mid-job go back to the wait list when the
//! next worker for that queue starts.

use super::RedisKeys;
use crate::broker::QueueHooks;
use crate::error::{ErrorDetail, JobError, JobResult};
use crate::handler::{JobHandler, Progress, ProgressSink};
use crate::job::{JobDescriptor, JobHandle, JobId, JobInfo, JobState, JobType};
use crate::metrics::JobMetrics;
use crate::queue::{JobQueue, QueueMode};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use futures::FutureExt;
use imgq_config::QueueConfig;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Redis-backed job queue for one job type.
pub struct RedisJobQueue {
    core: Arc<QueueCore>,
    shutdown_tx: broadcast::Sender<()>,
    handler_attached: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct QueueCore {
    pool: Pool,
    keys: RedisKeys,
    job_type: JobType,
    queue_name: &'static str,
    hooks: QueueHooks,
    policy: RetryPolicy,
    job_timeout: Duration,
    poll_timeout_secs: u64,
    closed: AtomicBool,
}

impl RedisJobQueue {
    /// Create a queue on an already verified pool.
    pub fn new(pool: Pool, keys: RedisKeys, job_type: JobType, config: &QueueConfig, hooks: QueueHooks) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            core: Arc::new(QueueCore {
                pool,
                keys,
                job_type,
                queue_name: job_type.queue_name(),
                hooks,
                policy: RetryPolicy::from_config(config),
                job_timeout: config.job_timeout(),
                poll_timeout_secs: config.poll_timeout_secs.max(1),
                closed: AtomicBool::new(false),
            }),
            shutdown_tx,
            handler_attached: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    async fn run(core: Arc<QueueCore>, handler: JobHandler, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(queue = core.queue_name, "Broker worker started");
        let mut stalled = true;

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Empty | TryRecvError::Lagged(_)) => {}
            }

            // This worker has nothing in flight here, so every id in the
            // active list was stranded.
            let next = if stalled {
                let recovered = core.recover_stalled().await;
                core.observe(recovered).map(|_| {
                    stalled = false;
                    None
                })
            } else {
                let next = core.next_job().await;
                core.observe(next)
            };

            match next {
                Ok(Some(job_id)) => stalled = !core.process(&job_id, &handler).await,
                Ok(None) => {}
                Err(e) => {
                    debug!(queue = core.queue_name, error = %e, "Broker worker poll failed");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(queue = core.queue_name, "Broker worker stopped");
    }
}

impl QueueCore {
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Reports connection-class errors to the shared status. Errors raised
    /// after `close` are expected and not reported.
    fn observe<T>(&self, result: JobResult<T>) -> JobResult<T> {
        if let Err(e) = &result {
            if let Some(kind) = e.connectivity() {
                if !self.closed.load(Ordering::Acquire) {
                    self.hooks.tracker.report_connection_error(kind, self.queue_name, e);
                }
            }
        }
        result
    }

    async fn enqueue(&self, job: &JobDescriptor) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(self.queue_name, job.id.as_str());

        let fields = [
            ("data", job.to_json()?),
            ("state", JobState::Waiting.to_string()),
            ("progress", "0".to_string()),
            ("attempts", "0".to_string()),
            ("created_at", job.created_at.timestamp_millis().to_string()),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&job_key, &fields)
            .lpush(self.keys.wait(self.queue_name), job.id.as_str())
            .query_async(&mut *conn)
            .await?;

        Ok(())
    }

    /// Moves due retries back to the wait list.
    async fn promote_delayed(&self, conn: &mut deadpool_redis::Connection) -> JobResult<()> {
        let delayed_key = self.keys.delayed(self.queue_name);
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn.zrangebyscore(&delayed_key, "-inf", now).await?;

        for job_id in due {
            // Only the worker that removes the entry requeues it.
            let removed: i64 = conn.zrem(&delayed_key, &job_id).await?;
            if removed == 1 {
                let _: () = conn.lpush(self.keys.wait(self.queue_name), &job_id).await?;
                debug!(job_id = %job_id, queue = self.queue_name, "Retry is due");
            }
        }

        Ok(())
    }

    /// Moves stranded active ids back onto the consuming end of the wait
    /// list, oldest first. Returns the number moved.
    async fn recover_stalled(&self) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let mut recovered = 0;

        loop {
            let job_id: Option<String> = recover_cmd(&self.keys, self.queue_name)
                .query_async(&mut *conn)
                .await?;
            let Some(job_id) = job_id else {
                break;
            };

            let job_key = self.keys.job(self.queue_name, &job_id);
            let exists: bool = conn.exists(&job_key).await?;
            if exists {
                let _: () = conn.hset(&job_key, "state", JobState::Waiting.to_string()).await?;
            }
            recovered += 1;
        }

        if recovered > 0 {
            warn!(queue = self.queue_name, recovered, "Requeued stalled jobs");
        }
        Ok(recovered)
    }

    async fn next_job(&self) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        self.promote_delayed(&mut conn).await?;

        let job_id: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.keys.wait(self.queue_name))
            .arg(self.keys.active(self.queue_name))
            .arg(self.poll_timeout_secs)
            .query_async(&mut *conn)
            .await?;

        Ok(job_id)
    }

    async fn start(&self, job_id: &str) -> JobResult<Option<(JobDescriptor, u32)>> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(self.queue_name, job_id);

        let data: Option<String> = conn.hget(&job_key, "data").await?;
        let Some(data) = data else {
            return Ok(None);
        };
        let job = JobDescriptor::from_json(&data)?;

        let attempts: u32 = conn.hincr(&job_key, "attempts", 1).await?;
        let _: () = conn.hset(&job_key, "state", JobState::Active.to_string()).await?;

        Ok(Some((job, attempts)))
    }

    async fn release(&self, job_id: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.lrem(self.keys.active(self.queue_name), 1, job_id).await?;
        Ok(())
    }

    async fn complete(&self, job_id: &str, result: &serde_json::Value) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp_millis();

        let fields = [
            ("state", JobState::Completed.to_string()),
            ("progress", "100".to_string()),
            ("result", serde_json::to_string(result)?),
            ("finished_at", now.to_string()),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.job(self.queue_name, job_id), &fields)
            .zadd(self.keys.completed(self.queue_name), job_id, now)
            .lrem(self.keys.active(self.queue_name), 1, job_id)
            .query_async(&mut *conn)
            .await?;

        Ok(())
    }

    async fn schedule_retry(&self, job_id: &str, delay: Duration, detail: &ErrorDetail) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let fields = [
            ("state", JobState::Waiting.to_string()),
            ("error", serde_json::to_string(detail)?),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.job(self.queue_name, job_id), &fields)
            .zadd(self.keys.delayed(self.queue_name), job_id, ready_at)
            .lrem(self.keys.active(self.queue_name), 1, job_id)
            .query_async(&mut *conn)
            .await?;

        Ok(())
    }

    async fn fail(&self, job_id: &str, detail: &ErrorDetail) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp_millis();

        let fields = [
            ("state", JobState::Failed.to_string()),
            ("error", serde_json::to_string(detail)?),
            ("finished_at", now.to_string()),
        ];

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.job(self.queue_name, job_id), &fields)
            .zadd(self.keys.failed(self.queue_name), job_id, now)
            .lrem(self.keys.active(self.queue_name), 1, job_id)
            .query_async(&mut *conn)
            .await?;

        Ok(())
    }

    /// Runs one popped job. Returns false when the job could not be settled
    /// and its id is still in the active list.
    async fn process(&self, job_id: &str, handler: &JobHandler) -> bool {
        let started_job = self.start(job_id).await;
        let (job, attempts) = match self.observe(started_job) {
            Ok(Some(started)) => started,
            Ok(None) => {
                warn!(job_id, queue = self.queue_name, "Job data missing, dropping");
                let released = self.release(job_id).await;
                return self.observe(released).is_ok();
            }
            Err(e) => {
                error!(job_id, queue = self.queue_name, error = %e, "Failed to start job");
                return false;
            }
        };

        let progress = Progress::new(Arc::new(RedisProgress {
            pool: self.pool.clone(),
            job_key: self.keys.job(self.queue_name, job_id),
        }));
        let payload = job.payload_value();
        let started = Instant::now();

        let run = AssertUnwindSafe(handler(job, progress)).catch_unwind();
        let outcome = match tokio::time::timeout(self.job_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JobError::Internal("job handler panicked".to_string())),
            Err(_) => Err(JobError::Timeout {
                operation: "job",
                after: self.job_timeout,
            }),
        };

        match outcome {
            Ok(result) => {
                JobMetrics::job_completed(self.job_type, QueueMode::Broker, started.elapsed());
                let stored = self.complete(job_id, &result).await;
                match self.observe(stored) {
                    Ok(()) => {
                        debug!(job_id, queue = self.queue_name, attempts, "Job completed");
                        true
                    }
                    Err(e) => {
                        error!(job_id, queue = self.queue_name, error = %e, "Failed to store job result");
                        false
                    }
                }
            }
            Err(e) => {
                JobMetrics::job_failed(self.job_type, QueueMode::Broker, started.elapsed());
                let detail = ErrorDetail::from(&e);

                if let Some(delay) = retry_delay(&self.policy, attempts, &e) {
                    warn!(
                        job_id,
                        queue = self.queue_name,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Job failed, retrying"
                    );
                    JobMetrics::job_retried(self.job_type, attempts);

                    let scheduled = self.schedule_retry(job_id, delay, &detail).await;
                    if let Err(e) = self.observe(scheduled) {
                        error!(job_id, queue = self.queue_name, error = %e, "Failed to schedule retry");
                        return false;
                    }
                    return true;
                }

                error!(job_id, queue = self.queue_name, attempts, error = %e, "Job failed");

                let stored = self.fail(job_id, &detail).await;
                if let Err(e) = self.observe(stored) {
                    error!(job_id, queue = self.queue_name, error = %e, "Failed to store job failure");
                    return false;
                }

                if let Some(recorder) = &self.hooks.dead_letter {
                    recorder
                        .record(self.queue_name, &JobId::from(job_id), payload, detail)
                        .await;
                }
                true
            }
        }
    }

    async fn get_job(&self, job_id: &JobId) -> JobResult<Option<JobInfo>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> =
            conn.hgetall(self.keys.job(self.queue_name, job_id.as_str())).await?;
        job_info_from_hash(&fields)
    }

    async fn clean(&self, older_than: Duration, state: JobState) -> JobResult<u64> {
        let set_key = match state {
            JobState::Completed => self.keys.completed(self.queue_name),
            JobState::Failed => self.keys.failed(self.queue_name),
            JobState::Waiting | JobState::Active => return Ok(0),
        };

        let mut conn = self.conn().await?;
        let threshold = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let expired: Vec<String> = conn.zrangebyscore(&set_key, "-inf", threshold).await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for job_id in &expired {
            pipe.del(self.keys.job(self.queue_name, job_id)).ignore();
            pipe.zrem(&set_key, job_id).ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;

        Ok(expired.len() as u64)
    }

    async fn pending(&self) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let (waiting, active, delayed): (u64, u64, u64) = redis::pipe()
            .llen(self.keys.wait(self.queue_name))
            .llen(self.keys.active(self.queue_name))
            .zcard(self.keys.delayed(self.queue_name))
            .query_async(&mut *conn)
            .await?;
        Ok(waiting + active + delayed)
    }
}

/// Pops the newest active id and appends it to the consuming end of the
/// wait list, so repeated calls leave the oldest stranded job next in line.
fn recover_cmd(keys: &RedisKeys, queue_name: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("LMOVE");
    cmd.arg(keys.active(queue_name))
        .arg(keys.wait(queue_name))
        .arg("LEFT")
        .arg("RIGHT");
    cmd
}

/// Delay before the next attempt, or `None` when the failure is terminal.
/// Only errors that can succeed on a later attempt are retried.
fn retry_delay(policy: &RetryPolicy, attempts: u32, error: &JobError) -> Option<Duration> {
    (error.is_retryable() && policy.should_retry(attempts)).then(|| policy.delay_for_attempt(attempts))
}

/// Rebuilds a [`JobInfo`] from a job hash. An empty hash means the job does
/// not exist.
fn job_info_from_hash(fields: &HashMap<String, String>) -> JobResult<Option<JobInfo>> {
    let Some(data) = fields.get("data") else {
        return Ok(None);
    };

    let job = JobDescriptor::from_json(data)?;
    let mut info = JobInfo::waiting(&job);

    if let Some(state) = fields.get("state") {
        info.state = state.parse()?;
    }
    info.progress = fields
        .get("progress")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    info.attempts = fields
        .get("attempts")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    info.result = fields
        .get("result")
        .map(|v| serde_json::from_str(v))
        .transpose()?;
    info.error = fields
        .get("error")
        .map(|v| serde_json::from_str(v))
        .transpose()?;
    info.finished_at = fields
        .get("finished_at")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    Ok(Some(info))
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn job_type(&self) -> JobType {
        self.core.job_type
    }

    fn mode(&self) -> QueueMode {
        QueueMode::Broker
    }

    async fn submit(&self, job: JobDescriptor) -> JobResult<JobHandle> {
        if job.job_type != self.core.job_type {
            return Err(JobError::Internal(format!(
                "{} job submitted to {} queue",
                job.job_type, self.core.queue_name
            )));
        }

        let enqueued = self.core.enqueue(&job).await;
        self.core.observe(enqueued)?;

        JobMetrics::job_submitted(job.job_type, QueueMode::Broker);
        debug!(job_id = %job.id, queue = self.core.queue_name, "Job enqueued on broker");

        Ok(JobHandle {
            id: job.id,
            job_type: job.job_type,
        })
    }

    fn register_handler(&self, handler: JobHandler) -> bool {
        if self.handler_attached.swap(true, Ordering::AcqRel) {
            debug!(queue = self.core.queue_name, "Handler already attached");
            return false;
        }

        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(Self::run(Arc::clone(&self.core), handler, shutdown_rx));
        *self.worker.lock() = Some(task);
        true
    }

    fn has_handler(&self) -> bool {
        self.handler_attached.load(Ordering::Acquire)
    }

    async fn get_job(&self, job_id: &JobId) -> JobResult<Option<JobInfo>> {
        let found = self.core.get_job(job_id).await;
        self.core.observe(found)
    }

    async fn clean(&self, older_than: Duration, state: JobState) -> JobResult<u64> {
        let removed = self.core.clean(older_than, state).await;
        self.core.observe(removed)
    }

    async fn pending(&self) -> JobResult<u64> {
        let pending = self.core.pending().await;
        self.core.observe(pending)
    }

    /// Stops the worker and closes the pool. A job in flight gets a short
    /// grace period to finish, after which the worker is aborted and the job
    /// stays in the active list for the next worker to requeue. Jobs still
    /// waiting stay on the broker.
    async fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.shutdown_tx.send(());

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(CLOSE_GRACE, &mut worker).await.is_err() {
                warn!(queue = self.core.queue_name, "Broker worker did not stop in time, aborting");
                worker.abort();
                let _ = worker.await;
            }
        }

        self.core.pool.close();
        debug!(queue = self.core.queue_name, "Broker queue closed");
    }
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("queue", &self.core.queue_name)
            .field("has_handler", &self.has_handler())
            .field("closed", &self.core.closed.load(Ordering::Relaxed))
            .finish()
    }
}

struct RedisProgress {
    pool: Pool,
    job_key: String,
}

#[async_trait]
impl ProgressSink for RedisProgress {
    async fn report(&self, percent: u8) {
        let result = async {
            let mut conn = self.pool.get().await?;
            let _: () = conn.hset(&self.job_key, "progress", percent).await?;
            Ok::<_, JobError>(())
        }
        .await;

        if let Err(e) = result {
            debug!(job_key = %self.job_key, error = %e, "Failed to store job progress");
        }
    }
}
