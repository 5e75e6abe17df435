//! In-process broker double shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use imgq_jobs::{
    Broker, ConnectivityKind, DeadLetterRecord, DeadLetterStore, InMemoryQueue, JobDescriptor,
    JobError, JobHandle, JobHandler, JobId, JobInfo, JobQueue, JobResult, JobState, JobType,
    QueueHooks, QueueMode,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn refused() -> JobError {
    JobError::BrokerUnavailable("connection refused".to_string())
}

/// Broker whose reachability is flipped by the test.
pub struct FakeBroker {
    up: Arc<AtomicBool>,
    probes: AtomicU32,
    opened: AtomicU32,
    closed: Arc<AtomicU32>,
    fail_open: Mutex<Option<JobType>>,
    close_delay: Mutex<Duration>,
    store: Arc<FakeStore>,
}

impl FakeBroker {
    pub fn new(up: bool) -> Arc<Self> {
        let up = Arc::new(AtomicBool::new(up));
        Arc::new(Self {
            store: Arc::new(FakeStore::new(Arc::clone(&up))),
            up,
            probes: AtomicU32::new(0),
            opened: AtomicU32::new(0),
            closed: Arc::new(AtomicU32::new(0)),
            fail_open: Mutex::new(None),
            close_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Makes `open_queue` fail for `job_type`.
    pub fn fail_open(&self, job_type: Option<JobType>) {
        *self.fail_open.lock() = job_type;
    }

    /// Makes every queue opened from now on take `delay` to close.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn queues_opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn queues_closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<FakeStore> {
        &self.store
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn probe(&self) -> JobResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(refused())
        }
    }

    async fn open_queue(&self, job_type: JobType, hooks: QueueHooks) -> JobResult<Arc<dyn JobQueue>> {
        if !self.up.load(Ordering::SeqCst) || *self.fail_open.lock() == Some(job_type) {
            return Err(refused());
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeQueue {
            inner: InMemoryQueue::new(job_type, hooks.dead_letter.clone()),
            up: Arc::clone(&self.up),
            closed: Arc::clone(&self.closed),
            close_delay: *self.close_delay.lock(),
            hooks,
        }))
    }

    async fn open_dead_letter_store(&self) -> JobResult<Arc<dyn DeadLetterStore>> {
        if self.up.load(Ordering::SeqCst) {
            Ok(Arc::clone(&self.store) as Arc<dyn DeadLetterStore>)
        } else {
            Err(refused())
        }
    }
}

/// Broker-mode queue that processes in memory but fails like a lost
/// connection while the broker is down.
pub struct FakeQueue {
    inner: InMemoryQueue,
    up: Arc<AtomicBool>,
    closed: Arc<AtomicU32>,
    close_delay: Duration,
    hooks: QueueHooks,
}

#[async_trait]
impl JobQueue for FakeQueue {
    fn job_type(&self) -> JobType {
        self.inner.job_type()
    }

    fn mode(&self) -> QueueMode {
        QueueMode::Broker
    }

    async fn submit(&self, job: JobDescriptor) -> JobResult<JobHandle> {
        if !self.up.load(Ordering::SeqCst) {
            let err = refused();
            let kind = err.connectivity().unwrap_or(ConnectivityKind::Other);
            self.hooks
                .tracker
                .report_connection_error(kind, self.job_type().queue_name(), &err);
            return Err(err);
        }
        self.inner.submit(job).await
    }

    fn register_handler(&self, handler: JobHandler) -> bool {
        self.inner.register_handler(handler)
    }

    fn has_handler(&self) -> bool {
        self.inner.has_handler()
    }

    async fn get_job(&self, job_id: &JobId) -> JobResult<Option<JobInfo>> {
        self.inner.get_job(job_id).await
    }

    async fn clean(&self, older_than: Duration, state: JobState) -> JobResult<u64> {
        self.inner.clean(older_than, state).await
    }

    async fn pending(&self) -> JobResult<u64> {
        self.inner.pending().await
    }

    async fn close(&self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}

/// Dead-letter store that shares the broker's reachability.
pub struct FakeStore {
    up: Arc<AtomicBool>,
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl FakeStore {
    fn new(up: Arc<AtomicBool>) -> Self {
        Self {
            up,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DeadLetterStore for FakeStore {
    async fn ping(&self) -> JobResult<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(refused())
        }
    }

    async fn add(&self, record: &DeadLetterRecord) -> JobResult<String> {
        self.ping().await?;
        self.records.lock().push(record.clone());
        Ok(record.id.clone())
    }

    async fn get(&self, id: &str) -> JobResult<Option<DeadLetterRecord>> {
        Ok(self.records.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, limit: usize) -> JobResult<Vec<DeadLetterRecord>> {
        Ok(self.records.lock().iter().rev().take(limit).cloned().collect())
    }

    async fn prune(&self, keep: usize) -> JobResult<u64> {
        let mut records = self.records.lock();
        let excess = records.len().saturating_sub(keep);
        records.drain(..excess);
        Ok(excess as u64)
    }

    async fn close(&self) {}
}

/// Polls `check` every 5ms until it holds or `within` passes.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
