//! imgq Jobs - Adaptive Image Job Queue
//!
//! Image processing jobs (compress, resize, convert, crop) go through one
//! queue per job type. Each queue is either:
//! - broker-backed: durable on Redis, with retries, timeouts and a
//!   dead-letter store, or
//! - local: in-process, one job at a time in submission order.
//!
//! A probe-driven monitor with hysteresis decides which one serves, and the
//! [`QueueManager`] swaps between them without losing or duplicating jobs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       QueueRuntime                            │
//! │                                                               │
//! │  BrokerAvailabilityMonitor ──probe──▶ Broker (Redis)          │
//! │            │                                                  │
//! │            ▼                                                  │
//! │      StatusTracker ◀── connection errors from broker queues   │
//! │        │       │                                              │
//! │        ▼       ▼                                              │
//! │  QueueManager  DeadLetterRecorder ──▶ store │ audit files     │
//! │        │                                                      │
//! │        ▼                                                      │
//! │   QueueSet: broker queues │ in-memory queues                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use imgq_jobs::{handler_fn, JobType, QueueRuntime};
//!
//! let runtime = QueueRuntime::connect(&config)?;
//! let manager = runtime.manager();
//!
//! manager
//!     .register_handler(
//!         JobType::Resize,
//!         handler_fn(|job, progress| async move {
//!             progress.report(50).await;
//!             Ok(job.payload_value())
//!         }),
//!     )
//!     .await;
//!
//! let handle = manager.submit(JobType::Resize, payload).await?;
//! let info = manager.get_status(&handle).await?;
//! ```

pub mod broker;
pub mod dead_letter;
pub mod error;
pub mod handler;
pub mod job;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod redis;
pub mod retry;
pub mod runtime;
pub mod status;

pub use broker::{Broker, BrokerProbe, QueueHooks};
pub use dead_letter::{DeadLetterRecord, DeadLetterRecorder, DeadLetterStore};
pub use error::{ConnectivityKind, ErrorDetail, JobError, JobResult};
pub use handler::{handler_fn, JobHandler, Progress, ProgressSink};
pub use job::{JobDescriptor, JobHandle, JobId, JobInfo, JobState, JobType};
pub use manager::{ManagerState, QueueManager};
pub use memory::InMemoryQueue;
pub use metrics::{register_metrics, BrokerMetrics, JobMetrics};
pub use monitor::{BrokerAvailabilityMonitor, Probe};
pub use queue::{JobQueue, JobSubmitter, QueueMode, QueueSet};
pub use crate::redis::{RedisBroker, RedisDeadLetterStore, RedisJobQueue, RedisKeys, RedisProbe};
pub use retry::{RetryPolicy, RetryStrategy};
pub use runtime::QueueRuntime;
pub use status::{BrokerStatus, StatusEvent, StatusSnapshot, StatusTracker, DEFAULT_STABILITY_THRESHOLD};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::handler::{handler_fn, Progress};
    pub use crate::job::{JobHandle, JobState, JobType};
    pub use crate::manager::QueueManager;
    pub use crate::queue::QueueMode;
    pub use crate::runtime::QueueRuntime;
    pub use crate::{JobError, JobResult};
}
