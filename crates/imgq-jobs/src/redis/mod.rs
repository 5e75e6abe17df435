//! Redis-backed broker: queues, dead-letter store, and probe.

mod dead_letter;
mod queue;

pub use dead_letter::RedisDeadLetterStore;
pub use queue::RedisJobQueue;

use crate::broker::{Broker, QueueHooks};
use crate::dead_letter::DeadLetterStore;
use crate::error::{JobError, JobResult};
use crate::job::JobType;
use crate::monitor::Probe;
use crate::queue::JobQueue;
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use imgq_config::{BrokerSettings, QueueConfig};
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Resolves the single connection form: the URL when one is configured,
/// otherwise the structured host/port/password/db fields.
pub fn connection_info(settings: &BrokerSettings) -> JobResult<ConnectionInfo> {
    match settings.url.as_deref() {
        Some(url) => url
            .into_connection_info()
            .map_err(|e| JobError::Configuration(format!("Invalid broker URL: {}", e))),
        None => Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(settings.host.clone(), settings.port),
            redis: RedisConnectionInfo {
                db: settings.db,
                password: settings.password.clone(),
                ..Default::default()
            },
        }),
    }
}

/// Create a Redis connection pool and verify it with a ping bounded by the
/// connect timeout. The pool is closed again if the ping fails.
pub async fn create_pool(settings: &BrokerSettings) -> JobResult<Pool> {
    debug!(target_addr = %settings.display_target(), "Creating Redis connection pool");

    let cfg = match settings.url.as_deref() {
        Some(url) => Config::from_url(url),
        None => Config::from_connection_info(connection_info(settings)?),
    };

    let timeout = settings.connect_timeout();
    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(settings.pool_size)
        .wait_timeout(Some(timeout))
        .create_timeout(Some(timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    if let Err(e) = ping(&pool, timeout).await {
        pool.close();
        return Err(e);
    }

    Ok(pool)
}

/// `PING` on a pooled connection, bounded by `timeout`.
pub async fn ping(pool: &Pool, timeout: Duration) -> JobResult<()> {
    let attempt = async {
        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok::<_, JobError>(())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(JobError::Timeout {
            operation: "redis ping",
            after: timeout,
        }),
    }
}

/// Redis key builder.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Waiting job IDs (list, pushed left, popped right).
    pub fn wait(&self, queue_name: &str) -> String {
        format!("{}:{}:wait", self.prefix, queue_name)
    }

    /// Job IDs handed to a worker (list).
    pub fn active(&self, queue_name: &str) -> String {
        format!("{}:{}:active", self.prefix, queue_name)
    }

    /// Job IDs waiting for a retry (sorted set by ready time).
    pub fn delayed(&self, queue_name: &str) -> String {
        format!("{}:{}:delayed", self.prefix, queue_name)
    }

    /// Completed job IDs (sorted set by finish time).
    pub fn completed(&self, queue_name: &str) -> String {
        format!("{}:{}:completed", self.prefix, queue_name)
    }

    /// Failed job IDs (sorted set by finish time).
    pub fn failed(&self, queue_name: &str) -> String {
        format!("{}:{}:failed", self.prefix, queue_name)
    }

    /// Job hash.
    pub fn job(&self, queue_name: &str, job_id: &str) -> String {
        format!("{}:{}:job:{}", self.prefix, queue_name, job_id)
    }

    /// Dead-letter index (sorted set by record time).
    pub fn dead_letter_index(&self) -> String {
        format!("{}:dead-letter", self.prefix)
    }

    /// Dead-letter record body.
    pub fn dead_letter_record(&self, record_id: &str) -> String {
        format!("{}:dead-letter:{}", self.prefix, record_id)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("imgq")
    }
}

/// Probe on a throwaway multiplexed connection.
#[derive(Debug, Clone)]
pub struct RedisProbe {
    info: ConnectionInfo,
    timeout: Duration,
}

impl RedisProbe {
    /// Creates a probe.
    pub fn new(info: ConnectionInfo, timeout: Duration) -> Self {
        Self { info, timeout }
    }
}

#[async_trait]
impl Probe for RedisProbe {
    async fn probe(&self) -> JobResult<()> {
        let client = redis::Client::open(self.info.clone())?;

        // The connection lives inside this future, so it is dropped on every
        // exit path, including the timeout.
        let attempt = async move {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
            if reply == "PONG" {
                Ok(())
            } else {
                Err(JobError::BrokerUnavailable(format!("unexpected ping reply: {}", reply)))
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                operation: "broker probe",
                after: self.timeout,
            }),
        }
    }
}

/// Redis broker. Each queue and the dead-letter store get their own pool.
pub struct RedisBroker {
    settings: BrokerSettings,
    queue: QueueConfig,
    keys: RedisKeys,
    probe: RedisProbe,
}

impl RedisBroker {
    /// Creates a broker. No connection is made until a queue or store is
    /// opened.
    pub fn new(settings: BrokerSettings, queue: QueueConfig, probe_timeout: Duration) -> JobResult<Self> {
        let probe = RedisProbe::new(connection_info(&settings)?, probe_timeout);
        let keys = RedisKeys::new(settings.key_prefix.clone());
        Ok(Self {
            settings,
            queue,
            keys,
            probe,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn probe(&self) -> JobResult<()> {
        self.probe.probe().await
    }

    async fn open_queue(&self, job_type: JobType, hooks: QueueHooks) -> JobResult<Arc<dyn JobQueue>> {
        let pool = create_pool(&self.settings).await?;
        let queue = RedisJobQueue::new(pool, self.keys.clone(), job_type, &self.queue, hooks);
        info!(queue = queue.job_type().queue_name(), target_addr = %self.settings.display_target(), "Broker queue connected");
        Ok(Arc::new(queue))
    }

    async fn open_dead_letter_store(&self) -> JobResult<Arc<dyn DeadLetterStore>> {
        let pool = create_pool(&self.settings).await?;
        Ok(Arc::new(RedisDeadLetterStore::new(
            pool,
            self.keys.clone(),
            self.settings.connect_timeout(),
        )))
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("target", &self.settings.display_target())
            .field("keys", &self.keys)
            .finish()
    }
}
