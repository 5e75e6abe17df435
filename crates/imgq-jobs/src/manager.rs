//! Queue manager.
//!
//! Owns the active [`QueueSet`] and moves it between broker and local mode
//! as broker availability changes. Callers only ever see one set of four
//! queues; which implementation backs them is an internal detail.
//!
//! Transitions follow two rules:
//!
//! - local to broker: the old local queues are sealed and keep draining with
//!   their attached handlers. Nothing is moved to the broker, so no job is
//!   delivered twice.
//! - broker to local: broker queues are closed before the local queues take
//!   over. Jobs still on the broker stay there until broker mode resumes.

use crate::broker::{Broker, QueueHooks};
use crate::dead_letter::DeadLetterRecorder;
use crate::error::{JobError, JobResult};
use crate::handler::JobHandler;
use crate::job::{JobDescriptor, JobHandle, JobId, JobInfo, JobState, JobType};
use crate::metrics::{BrokerMetrics, JobMetrics};
use crate::queue::{JobQueue, JobSubmitter, QueueMode, QueueSet};
use crate::status::{BrokerStatus, StatusEvent, StatusTracker};
use async_trait::async_trait;
use imgq_config::QueueConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lifecycle of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Nothing built yet.
    Uninitialized,
    /// Building a queue set, at startup or during a transition.
    Initializing,
    /// Serving from broker queues.
    ActiveBroker,
    /// Serving from in-memory queues.
    ActiveLocal,
}

impl ManagerState {
    /// Returns true in either active state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, ManagerState::ActiveBroker | ManagerState::ActiveLocal)
    }

    /// Mode served in this state, if any.
    #[must_use]
    pub const fn mode(self) -> Option<QueueMode> {
        match self {
            ManagerState::ActiveBroker => Some(QueueMode::Broker),
            ManagerState::ActiveLocal => Some(QueueMode::Local),
            ManagerState::Uninitialized | ManagerState::Initializing => None,
        }
    }
}

impl From<QueueMode> for ManagerState {
    fn from(mode: QueueMode) -> Self {
        match mode {
            QueueMode::Broker => ManagerState::ActiveBroker,
            QueueMode::Local => ManagerState::ActiveLocal,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Uninitialized => "uninitialized",
            ManagerState::Initializing => "initializing",
            ManagerState::ActiveBroker => "active_broker",
            ManagerState::ActiveLocal => "active_local",
        };
        f.write_str(name)
    }
}

/// Restores a usable queue set if a transition future is dropped midway.
struct TransitionGuard<'a> {
    manager: &'a QueueManager,
    finished: bool,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.recover_local();
        }
    }
}

/// Adaptive queue manager.
///
/// The state doubles as the transition guard: a transition only starts by
/// atomically moving an active state to `Initializing`, so a trigger that
/// arrives while one is running is ignored.
pub struct QueueManager {
    broker: Option<Arc<dyn Broker>>,
    tracker: Arc<StatusTracker>,
    dead_letter: Option<Arc<DeadLetterRecorder>>,
    config: QueueConfig,
    state: watch::Sender<ManagerState>,
    init: OnceCell<()>,
    closed: AtomicBool,
    active: RwLock<Option<QueueSet>>,
    /// Sealed local queues still draining, kept for status lookups.
    retired: Mutex<Vec<Arc<dyn JobQueue>>>,
    handlers: Mutex<BTreeMap<JobType, JobHandler>>,
    /// Whether the active set's queue of each type has a handler. Reset on
    /// every transition.
    attached: Mutex<BTreeMap<JobType, bool>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl QueueManager {
    /// Creates a manager. Without a broker it only ever runs locally.
    pub fn new(
        broker: Option<Arc<dyn Broker>>,
        tracker: Arc<StatusTracker>,
        dead_letter: Option<Arc<DeadLetterRecorder>>,
        config: QueueConfig,
    ) -> Self {
        let (state, _) = watch::channel(ManagerState::Uninitialized);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            broker,
            tracker,
            dead_letter,
            config,
            state,
            init: OnceCell::new(),
            closed: AtomicBool::new(false),
            active: RwLock::new(None),
            retired: Mutex::new(Vec::new()),
            handlers: Mutex::new(BTreeMap::new()),
            attached: Mutex::new(BTreeMap::new()),
            shutdown_tx,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    /// Mode currently served, or `None` before the first set is built and
    /// while a transition runs.
    pub fn mode(&self) -> Option<QueueMode> {
        self.state().mode()
    }

    /// Returns true while a handler is attached to the active queue of
    /// `job_type`.
    pub fn handler_attached(&self, job_type: JobType) -> bool {
        self.attached.lock().get(&job_type).copied().unwrap_or(false)
    }

    /// Number of retired local queues still held.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Builds the first queue set. Concurrent and repeated calls share one
    /// initialization.
    pub async fn initialize(&self) -> ManagerState {
        self.init
            .get_or_init(|| async {
                let target = if self.broker.is_some() {
                    QueueMode::Broker
                } else {
                    QueueMode::Local
                };
                info!(preferred = %target, "Initializing queue manager");
                self.switch_to(target).await;
            })
            .await;

        self.state()
    }

    /// Waits until a queue set is active. Does not start initialization.
    pub async fn await_ready(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once active.
        let _ = rx.wait_for(|state| state.is_active()).await;
    }

    /// Initializes if needed and reports whether broker queues are serving.
    pub async fn is_available(&self) -> bool {
        self.initialize().await;
        self.await_ready().await;
        self.state() == ManagerState::ActiveBroker
    }

    /// Submits a job, initializing first if needed.
    ///
    /// A connectivity error from the broker switches to local mode and the
    /// job is resubmitted once there.
    pub async fn submit(&self, job_type: JobType, payload: Map<String, Value>) -> JobResult<JobHandle> {
        self.ensure_open()?;
        self.initialize().await;
        self.await_ready().await;

        let job = JobDescriptor::new(job_type, payload);

        match self.submit_active(job.clone()).await {
            Err(e) if e.is_connectivity() => {
                warn!(
                    job_id = %job.id,
                    job_type = %job_type,
                    error = %e,
                    "Broker submit failed, resubmitting locally"
                );
                self.transition(QueueMode::Local).await;
                self.await_ready().await;
                self.submit_active(job).await
            }
            other => other,
        }
    }

    async fn submit_active(&self, job: JobDescriptor) -> JobResult<JobHandle> {
        let active = self.active.read().await;
        let queue = active
            .as_ref()
            .and_then(|set| set.get(job.job_type))
            .ok_or_else(|| JobError::Internal(format!("no active queue for {}", job.job_type)))?;
        queue.submit(job).await
    }

    /// Registers the handler for `job_type`.
    ///
    /// Idempotent: the first handler is kept and later calls return false.
    /// The handler is attached to the active queue now and to every queue
    /// built by later transitions.
    pub async fn register_handler(&self, job_type: JobType, handler: JobHandler) -> bool {
        {
            let mut handlers = self.handlers.lock();
            if handlers.contains_key(&job_type) {
                debug!(job_type = %job_type, "Handler already registered");
                return false;
            }
            handlers.insert(job_type, handler.clone());
        }

        {
            let active = self.active.read().await;
            if let Some(set) = active.as_ref() {
                self.attach(set, job_type, &handler);
            }
        }

        // Retired queues created before this registration still need
        // something to drain them.
        let retired = self.retired.lock().clone();
        for queue in retired.iter().filter(|q| q.job_type() == job_type) {
            if !queue.has_handler() {
                queue.register_handler(handler.clone());
            }
        }

        info!(job_type = %job_type, "Job handler registered");
        true
    }

    fn attach(&self, set: &QueueSet, job_type: JobType, handler: &JobHandler) {
        let Some(queue) = set.get(job_type) else {
            return;
        };
        let attached = queue.register_handler(handler.clone()) || queue.has_handler();
        self.attached.lock().insert(job_type, attached);
    }

    fn attach_all(&self, set: &QueueSet) {
        self.attached.lock().clear();
        let handlers = self.handlers.lock().clone();
        for (job_type, handler) in &handlers {
            self.attach(set, *job_type, handler);
        }
    }

    /// Looks up a job in the active queues, then in retired local queues.
    pub async fn get_status(&self, handle: &JobHandle) -> JobResult<Option<JobInfo>> {
        self.get_job(handle.job_type, &handle.id).await
    }

    /// Looks up a job by type and ID.
    pub async fn get_job(&self, job_type: JobType, job_id: &JobId) -> JobResult<Option<JobInfo>> {
        let queue = {
            let active = self.active.read().await;
            active.as_ref().and_then(|set| set.get(job_type))
        };

        if let Some(queue) = queue {
            if let Some(info) = queue.get_job(job_id).await? {
                return Ok(Some(info));
            }
        }

        let retired = self.retired.lock().clone();
        for queue in retired.iter().filter(|q| q.job_type() == job_type) {
            if let Some(info) = queue.get_job(job_id).await? {
                return Ok(Some(info));
            }
        }

        Ok(None)
    }

    /// Removes completed jobs past their retention and failed jobs past
    /// theirs, on every queue. Waits briefly for initialization and skips
    /// when the manager is still not ready. Returns the number removed.
    pub async fn clean_old_jobs(&self) -> u64 {
        if tokio::time::timeout(self.config.ready_wait(), self.await_ready())
            .await
            .is_err()
        {
            debug!("Queue manager not ready, skipping cleanup");
            return 0;
        }

        let mut queues: Vec<Arc<dyn JobQueue>> = {
            let active = self.active.read().await;
            active
                .as_ref()
                .map(|set| set.iter().map(|(_, q)| Arc::clone(q)).collect())
                .unwrap_or_default()
        };
        let active_count = queues.len();
        queues.extend(self.retired.lock().iter().cloned());

        let passes = [
            (JobState::Completed, self.config.completed_retention()),
            (JobState::Failed, self.config.failed_retention()),
        ];

        let mut removed = 0;
        for (index, queue) in queues.iter().enumerate() {
            if index < active_count {
                if let Ok(pending) = queue.pending().await {
                    JobMetrics::update_pending(queue.job_type(), queue.mode(), pending);
                }
            }

            for (state, retention) in passes {
                match queue.clean(retention, state).await {
                    Ok(count) => removed += count,
                    Err(e) => warn!(
                        queue = queue.job_type().queue_name(),
                        state = %state,
                        error = %e,
                        "Job cleanup failed"
                    ),
                }
            }
        }

        self.prune_retired().await;

        if removed > 0 {
            info!(removed, "Old jobs cleaned");
        }
        removed
    }

    async fn prune_retired(&self) {
        let retired = self.retired.lock().clone();
        let mut drained = Vec::new();
        for queue in &retired {
            if matches!(queue.pending().await, Ok(0)) {
                drained.push(queue_addr(queue));
            }
        }

        if drained.is_empty() {
            return;
        }

        self.retired
            .lock()
            .retain(|q| !drained.contains(&queue_addr(q)));
        debug!(count = drained.len(), "Dropped drained retired queues");
    }

    /// Resubmits a dead-letter record to `target_queue`. Returns false when
    /// the record is missing, belongs to another queue, or the submit fails.
    pub async fn retry_dead_letter(&self, record_id: &str, target_queue: &str) -> bool {
        match &self.dead_letter {
            Some(recorder) => recorder.retry(record_id, target_queue, self).await,
            None => {
                warn!(record_id, "No dead-letter recorder configured");
                false
            }
        }
    }

    /// Switches to `target`. Ignored before initialization, while another
    /// transition runs, or when `target` is already served. Returns the mode
    /// actually reached, which is local when broker queues cannot be built.
    pub async fn transition(&self, target: QueueMode) -> Option<QueueMode> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut from = None;
        let started = self.state.send_if_modified(|state| match state.mode() {
            Some(mode) if mode != target => {
                from = Some(mode);
                *state = ManagerState::Initializing;
                true
            }
            _ => false,
        });

        if !started {
            debug!(target_mode = %target, state = %self.state(), "Transition not started");
            return None;
        }

        info!(from = ?from.map(QueueMode::as_str), to = %target, "Switching queue mode");
        Some(self.switch_to(target).await)
    }

    async fn switch_to(&self, target: QueueMode) -> QueueMode {
        let mut guard = TransitionGuard {
            manager: self,
            finished: false,
        };
        self.attached.lock().clear();
        let mut active = self.active.write().await;
        self.state.send_replace(ManagerState::Initializing);

        if let Some(previous) = active.take() {
            self.retire(previous).await;
        }

        let set = match target {
            QueueMode::Broker => match self.open_broker_set().await {
                Ok(set) => set,
                Err(e) => {
                    warn!(error = %e, "Broker queues unavailable, falling back to local queues");
                    QueueSet::local(self.dead_letter.clone())
                }
            },
            QueueMode::Local => QueueSet::local(self.dead_letter.clone()),
        };

        self.attach_all(&set);
        let mode = set.mode();
        *active = Some(set);
        drop(active);
        guard.finished = true;

        self.state.send_replace(ManagerState::from(mode));
        BrokerMetrics::transition(mode);
        info!(mode = %mode, "Queue mode active");
        mode
    }

    fn recover_local(&self) {
        warn!("Queue transition interrupted, restoring local queues");
        let Ok(mut active) = self.active.try_write() else {
            return;
        };

        let mode = match active.as_ref() {
            Some(set) => set.mode(),
            None => {
                let set = QueueSet::local(self.dead_letter.clone());
                self.attach_all(&set);
                *active = Some(set);
                QueueMode::Local
            }
        };
        self.state.send_replace(ManagerState::from(mode));
    }

    async fn open_broker_set(&self) -> JobResult<QueueSet> {
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| JobError::BrokerUnavailable("no broker configured".to_string()))?;

        broker.probe().await?;

        let hooks = QueueHooks {
            tracker: Arc::clone(&self.tracker),
            dead_letter: self.dead_letter.clone(),
        };

        let mut opened: Vec<Arc<dyn JobQueue>> = Vec::with_capacity(JobType::ALL.len());
        for job_type in JobType::ALL {
            match broker.open_queue(job_type, hooks.clone()).await {
                Ok(queue) => opened.push(queue),
                Err(e) => {
                    error!(queue = job_type.queue_name(), error = %e, "Failed to open broker queue");
                    for queue in &opened {
                        queue.close().await;
                    }
                    return Err(e);
                }
            }
        }

        QueueSet::new(QueueMode::Broker, opened)
    }

    async fn retire(&self, previous: QueueSet) {
        match previous.mode() {
            QueueMode::Broker => {
                previous.close_all().await;
                debug!("Broker queues closed");
            }
            QueueMode::Local => {
                let mut sealed = Vec::new();
                for (_, queue) in previous.iter() {
                    queue.close().await;
                    sealed.push(Arc::clone(queue));
                }
                self.retired.lock().extend(sealed);
                debug!("Local queues sealed and retired");
            }
        }
    }

    /// Follows status events from the tracker until shutdown.
    ///
    /// `Available` while local moves to the broker. `Unavailable` or a
    /// reported connection error while on the broker moves to local.
    pub fn spawn_status_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.tracker.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = events.recv() => match event {
                        Ok(event) => manager.on_status_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Queue manager status listener lagged");
                            manager.reconcile().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    async fn on_status_event(&self, event: StatusEvent) {
        let target = match (event, self.mode()) {
            (StatusEvent::Changed(BrokerStatus::Available), Some(QueueMode::Local)) => QueueMode::Broker,
            (StatusEvent::Changed(BrokerStatus::Unavailable), Some(QueueMode::Broker))
            | (StatusEvent::ConnectionError(_), Some(QueueMode::Broker)) => QueueMode::Local,
            _ => return,
        };
        self.transition(target).await;
    }

    /// Corrects drift: when serving locally while the broker is reported
    /// available, probes on demand and switches on success.
    pub async fn reconcile(&self) -> Option<QueueMode> {
        if self.mode() != Some(QueueMode::Local) || !self.tracker.status().is_available() {
            return None;
        }

        let broker = self.broker.as_ref()?;
        if let Err(e) = broker.probe().await {
            debug!(error = %e, "Reconcile probe failed");
            return None;
        }

        self.transition(QueueMode::Broker).await
    }

    /// Runs [`reconcile`](Self::reconcile) every `period` until shutdown.
    pub fn spawn_reconciler(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; initialization covers it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        manager.reconcile().await;
                    }
                }
            }
        })
    }

    fn ensure_open(&self) -> JobResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(JobError::Internal("queue manager is shut down".to_string()))
        } else {
            Ok(())
        }
    }

    /// Stops background tasks and closes every queue. Best effort.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.shutdown_tx.send(());

        let previous = self.active.write().await.take();
        if let Some(set) = previous {
            set.close_all().await;
        }

        let retired = std::mem::take(&mut *self.retired.lock());
        for queue in retired {
            queue.close().await;
        }

        info!("Queue manager shut down");
    }
}

/// Identity of a queue allocation, usable across await points.
fn queue_addr(queue: &Arc<dyn JobQueue>) -> usize {
    Arc::as_ptr(queue).cast::<()>() as usize
}

#[async_trait]
impl JobSubmitter for QueueManager {
    async fn submit_to_queue(&self, queue_name: &str, payload: Value) -> JobResult<JobHandle> {
        let job_type = JobType::from_queue_name(queue_name)?;
        match payload {
            Value::Object(map) => self.submit(job_type, map).await,
            other => Err(JobError::Internal(format!(
                "payload for {} must be an object, got {}",
                queue_name, other
            ))),
        }
    }
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("state", &self.state())
            .field("has_broker", &self.broker.is_some())
            .field("retired", &self.retired_count())
            .finish()
    }
}
