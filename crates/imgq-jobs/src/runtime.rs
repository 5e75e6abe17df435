//! Process wiring.
//!
//! [`QueueRuntime`] builds the shared status tracker, the availability
//! monitor, the dead-letter recorder and the queue manager, connects them
//! through status listeners, and runs periodic maintenance.

use crate::broker::{Broker, BrokerProbe};
use crate::dead_letter::DeadLetterRecorder;
use crate::error::JobResult;
use crate::manager::QueueManager;
use crate::metrics::register_metrics;
use crate::monitor::BrokerAvailabilityMonitor;
use crate::status::{BrokerStatus, StatusTracker};
use imgq_config::{AppConfig, ConfigLoader};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Running queue core.
pub struct QueueRuntime {
    tracker: Arc<StatusTracker>,
    monitor: Option<Arc<BrokerAvailabilityMonitor>>,
    recorder: Arc<DeadLetterRecorder>,
    manager: Arc<QueueManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl QueueRuntime {
    /// Starts against the Redis broker described by `config.broker`.
    pub fn connect(config: &AppConfig) -> JobResult<Self> {
        let broker = crate::redis::RedisBroker::new(
            config.broker.clone(),
            config.queue.clone(),
            config.monitor.probe_timeout(),
        )?;
        Ok(Self::start(config, Some(Arc::new(broker))))
    }

    /// Loads layered configuration from `config_dir`, then connects.
    pub fn from_config_dir(config_dir: &str) -> JobResult<Self> {
        let loader = ConfigLoader::new(config_dir)?;
        Self::connect(loader.get())
    }

    /// Wires everything up and starts background tasks. Without a broker the
    /// runtime serves from local queues only and no monitor runs.
    ///
    /// Initialization runs in the background; submissions made before it
    /// finishes wait for it.
    pub fn start(config: &AppConfig, broker: Option<Arc<dyn Broker>>) -> Self {
        register_metrics();

        let tracker = Arc::new(StatusTracker::new(
            BrokerStatus::Unavailable,
            config.monitor.stability_threshold,
        ));
        let recorder = Arc::new(DeadLetterRecorder::new(&config.dead_letter, broker.clone()));
        let manager = Arc::new(QueueManager::new(
            broker.clone(),
            Arc::clone(&tracker),
            Some(Arc::clone(&recorder)),
            config.queue.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        // Listeners subscribe before the monitor can publish anything.
        let mut tasks = vec![
            recorder.spawn_status_listener(&tracker),
            manager.spawn_status_listener(),
        ];

        let startup = {
            let manager = Arc::clone(&manager);
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                let state = manager.initialize().await;
                let durable = recorder.connect().await;
                info!(state = %state, durable_dead_letters = durable, "Queue runtime ready");
            })
        };
        tasks.push(startup);

        let monitor = broker.map(|broker| {
            let probe = Arc::new(BrokerProbe::new(broker));
            Arc::new(BrokerAvailabilityMonitor::new(probe, Arc::clone(&tracker), &config.monitor))
        });
        if let Some(monitor) = &monitor {
            tasks.push(monitor.spawn());
            tasks.push(manager.spawn_reconciler(config.monitor.reconcile_interval()));
        }

        let runtime = Self {
            tracker,
            monitor,
            recorder,
            manager,
            tasks: Mutex::new(tasks),
            shutdown_tx,
        };
        let maintenance = runtime.spawn_maintenance(config.queue.cleanup_interval());
        runtime.tasks.lock().push(maintenance);

        runtime
    }

    /// Queue manager; the entry point for submitting work.
    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Shared broker status.
    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    /// Dead-letter recorder.
    pub fn recorder(&self) -> &Arc<DeadLetterRecorder> {
        &self.recorder
    }

    /// Availability monitor, when a broker is configured.
    pub fn monitor(&self) -> Option<&Arc<BrokerAvailabilityMonitor>> {
        self.monitor.as_ref()
    }

    /// One maintenance pass: old jobs, then dead-letter retention. Returns
    /// the number of jobs and records removed.
    pub async fn run_maintenance(&self) -> (u64, u64) {
        maintain(&self.manager, &self.recorder).await
    }

    fn spawn_maintenance(&self, period: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let recorder = Arc::clone(&self.recorder);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        maintain(&manager, &recorder).await;
                    }
                }
            }
        })
    }

    /// Stops background tasks, closes every queue and detaches the
    /// dead-letter store.
    pub async fn shutdown(&self) {
        info!("Shutting down queue runtime");

        let _ = self.shutdown_tx.send(());
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }

        self.manager.shutdown().await;
        self.recorder.close().await;

        // The recorder listener only ends when the tracker goes away.
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }
}

async fn maintain(manager: &QueueManager, recorder: &DeadLetterRecorder) -> (u64, u64) {
    let jobs = manager.clean_old_jobs().await;
    let records = recorder.cleanup(recorder.retention_count()).await;
    debug!(jobs, records, "Maintenance pass finished");
    (jobs, records)
}

impl std::fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntime")
            .field("manager", &self.manager)
            .field("tracker", &self.tracker)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use crate::manager::ManagerState;
    use serde_json::Map;

    fn local_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.dead_letter.directory = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_local_runtime_starts_without_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = QueueRuntime::start(&local_config(dir.path()), None);

        runtime.manager().await_ready().await;
        assert_eq!(runtime.manager().state(), ManagerState::ActiveLocal);
        assert!(runtime.monitor().is_none());
        assert!(!runtime.recorder().is_durable());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[monitor]\nstability_threshold = 0\n",
        )
        .unwrap();

        let result = QueueRuntime::from_config_dir(&dir.path().to_string_lossy());
        assert!(matches!(result, Err(crate::error::JobError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_maintenance_runs_in_local_mode() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = QueueRuntime::start(&local_config(dir.path()), None);

        runtime
            .manager()
            .submit(JobType::Compress, Map::new())
            .await
            .unwrap();

        assert_eq!(runtime.run_maintenance().await, (0, 0));
        runtime.shutdown().await;
    }
}
