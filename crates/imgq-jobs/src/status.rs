//! Shared broker status with hysteresis.
//!
//! `StatusTracker` is the single owner of the process-wide broker status.
//! Every observation, whether from a scheduled probe or from a connection
//! error on the hot path, goes through the same pair of consecutive-result
//! counters, so two components can never flap the status independently.
//!
//! A status flip:
//! - requires `threshold` consecutive results opposite to the current status
//! - resets both counters
//! - emits exactly one [`StatusEvent::Changed`]

use crate::error::ConnectivityKind;
use crate::metrics::BrokerMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default number of consecutive results required to flip status.
pub const DEFAULT_STABILITY_THRESHOLD: u32 = 3;

const EVENT_CAPACITY: usize = 64;

/// Broker availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStatus {
    /// Broker answers probes.
    Available,
    /// Broker is unreachable.
    Unavailable,
}

impl BrokerStatus {
    /// Returns true for [`BrokerStatus::Available`].
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, BrokerStatus::Available)
    }
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerStatus::Available => write!(f, "available"),
            BrokerStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Notification sent to status subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// The status flipped.
    Changed(BrokerStatus),
    /// A broker queue hit a connection-class error on the hot path.
    ConnectionError(ConnectivityKind),
}

/// Snapshot of the hysteresis counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Current status.
    pub status: BrokerStatus,
    /// Consecutive successful observations.
    pub consecutive_successes: u32,
    /// Consecutive failed observations.
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Counters {
    status: BrokerStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

/// Process-wide broker status with hysteresis and a subscriber channel.
pub struct StatusTracker {
    counters: Mutex<Counters>,
    threshold: u32,
    events: broadcast::Sender<StatusEvent>,
    logged: Mutex<HashSet<ConnectivityKind>>,
}

impl StatusTracker {
    /// Creates a tracker. A threshold of zero is treated as one.
    pub fn new(initial: BrokerStatus, threshold: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        BrokerMetrics::status(initial.is_available());

        Self {
            counters: Mutex::new(Counters {
                status: initial,
                consecutive_successes: 0,
                consecutive_failures: 0,
            }),
            threshold: threshold.max(1),
            events,
            logged: Mutex::new(HashSet::new()),
        }
    }

    /// Current status.
    pub fn status(&self) -> BrokerStatus {
        self.counters.lock().status
    }

    /// Current status and counters.
    pub fn snapshot(&self) -> StatusSnapshot {
        let counters = self.counters.lock();
        StatusSnapshot {
            status: counters.status,
            consecutive_successes: counters.consecutive_successes,
            consecutive_failures: counters.consecutive_failures,
        }
    }

    /// Flip threshold.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Subscribe to status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Feeds one observation. Returns the new status when it flipped.
    pub fn observe(&self, reachable: bool) -> Option<BrokerStatus> {
        let flipped = {
            let mut counters = self.counters.lock();

            if reachable {
                counters.consecutive_successes = counters.consecutive_successes.saturating_add(1);
                counters.consecutive_failures = 0;
            } else {
                counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);
                counters.consecutive_successes = 0;
            }

            let target = match counters.status {
                BrokerStatus::Unavailable
                    if counters.consecutive_successes >= self.threshold =>
                {
                    Some(BrokerStatus::Available)
                }
                BrokerStatus::Available if counters.consecutive_failures >= self.threshold => {
                    Some(BrokerStatus::Unavailable)
                }
                _ => None,
            };

            if let Some(status) = target {
                counters.status = status;
                counters.consecutive_successes = 0;
                counters.consecutive_failures = 0;
            }

            target
        };

        if let Some(status) = flipped {
            self.logged.lock().clear();
            BrokerMetrics::status(status.is_available());

            match status {
                BrokerStatus::Available => info!("Broker is available"),
                BrokerStatus::Unavailable => warn!("Broker is unavailable"),
            }

            // No subscribers is fine.
            let _ = self.events.send(StatusEvent::Changed(status));
        }

        flipped
    }

    /// Records a successful observation.
    pub fn record_success(&self) -> Option<BrokerStatus> {
        self.observe(true)
    }

    /// Records a failed observation.
    pub fn record_failure(&self) -> Option<BrokerStatus> {
        self.observe(false)
    }

    /// Hot-path report from a broker queue: counts a failure, logs once per
    /// error class, and notifies subscribers without waiting for a probe.
    pub fn report_connection_error(
        &self,
        kind: ConnectivityKind,
        source: &str,
        err: &dyn fmt::Display,
    ) -> Option<BrokerStatus> {
        self.log_connectivity(kind, source, err);
        let flipped = self.record_failure();
        let _ = self.events.send(StatusEvent::ConnectionError(kind));
        flipped
    }

    /// Logs a connectivity error once per class until the status changes.
    /// Returns true if the error was logged.
    pub fn log_connectivity(&self, kind: ConnectivityKind, source: &str, err: &dyn fmt::Display) -> bool {
        if self.logged.lock().insert(kind) {
            error!(kind = %kind, source, error = %err, "Broker connection error");
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("snapshot", &self.snapshot())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new(BrokerStatus::Unavailable, DEFAULT_STABILITY_THRESHOLD)
    }
}
