//! Broker availability monitor.

use crate::error::{ConnectivityKind, JobError, JobResult};
use crate::metrics::BrokerMetrics;
use crate::status::{BrokerStatus, StatusTracker};
use async_trait::async_trait;
use imgq_config::MonitorConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// Single round-trip liveness test against the broker.
///
/// Implementations open a throwaway connection, send a ping, and release the
/// connection on every exit path.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns `Ok(())` only if the broker answered the ping.
    async fn probe(&self) -> JobResult<()>;
}

/// Periodically probes the broker and feeds results into the shared
/// [`StatusTracker`].
pub struct BrokerAvailabilityMonitor {
    probe: Arc<dyn Probe>,
    tracker: Arc<StatusTracker>,
    interval: Duration,
    timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl BrokerAvailabilityMonitor {
    /// Creates a monitor.
    pub fn new(probe: Arc<dyn Probe>, tracker: Arc<StatusTracker>, config: &MonitorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            probe,
            tracker,
            interval: config.interval(),
            timeout: config.probe_timeout(),
            shutdown_tx,
        }
    }

    /// Shared status this monitor feeds.
    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    /// Runs one probe. Never errors: any failure, including the timeout,
    /// reads as unreachable.
    pub async fn probe(&self) -> bool {
        let result = match tokio::time::timeout(self.timeout, self.probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                operation: "broker probe",
                after: self.timeout,
            }),
        };

        BrokerMetrics::probe(result.is_ok());

        match result {
            Ok(()) => true,
            Err(e) => {
                let kind = e.connectivity().unwrap_or(ConnectivityKind::Other);
                self.tracker.log_connectivity(kind, "probe", &e);
                false
            }
        }
    }

    /// Probes once and feeds the result through the hysteresis counters.
    /// Returns the new status when it flipped.
    pub async fn check(&self) -> Option<BrokerStatus> {
        let reachable = self.probe().await;
        debug!(reachable, "Broker probe");
        self.tracker.observe(reachable)
    }

    /// Spawns the probe loop. The first probe runs immediately.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!(
                interval_secs = monitor.interval.as_secs(),
                threshold = monitor.tracker.threshold(),
                "Starting broker availability monitor"
            );

            let mut ticker = interval(monitor.interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Broker availability monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.check().await;
                    }
                }
            }
        })
    }

    /// Stops the probe loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for BrokerAvailabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAvailabilityMonitor")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("tracker", &self.tracker)
            .finish()
    }
}
