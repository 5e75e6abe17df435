//! Application configuration structures.

use imgq_core::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Logging configuration.
    #[serde(default)]
    pub logging: TelemetryConfig,

    /// Broker connection configuration.
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Availability monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Queue behaviour configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Dead-letter configuration.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "imgq".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Broker connection settings.
///
/// Either `url` is set, or the structured host/port/password/db fields are
/// used. The two forms are never mixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Full connection URL. Takes precedence over the structured fields.
    #[serde(default)]
    pub url: Option<String>,

    /// Broker host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Broker password.
    #[serde(default)]
    pub password: Option<String>,

    /// Database index.
    #[serde(default)]
    pub db: i64,

    /// Connection pool size per queue.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connect and ping timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Key prefix for all queue keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            password: None,
            db: 0,
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_key_prefix() -> String {
    "imgq".to_string()
}

impl BrokerSettings {
    /// Environment variable holding a full connection URL.
    pub const ENV_URL: &'static str = "REDIS_URL";
    /// Environment variable holding the host.
    pub const ENV_HOST: &'static str = "REDIS_HOST";
    /// Environment variable holding the port.
    pub const ENV_PORT: &'static str = "REDIS_PORT";
    /// Environment variable holding the password.
    pub const ENV_PASSWORD: &'static str = "REDIS_PASSWORD";
    /// Environment variable holding the database index.
    pub const ENV_DB: &'static str = "REDIS_DB";

    /// Applies `REDIS_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup. Unparseable numbers are
    /// ignored and the current value is kept.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(Self::ENV_URL).filter(|v| !v.is_empty()) {
            self.url = Some(url);
        }
        if let Some(host) = lookup(Self::ENV_HOST).filter(|v| !v.is_empty()) {
            self.host = host;
        }
        if let Some(port) = lookup(Self::ENV_PORT).and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(password) = lookup(Self::ENV_PASSWORD).filter(|v| !v.is_empty()) {
            self.password = Some(password);
        }
        if let Some(db) = lookup(Self::ENV_DB).and_then(|v| v.parse().ok()) {
            self.db = db;
        }
    }

    /// Returns the connect timeout as a Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Human-readable target for logs. Never includes the password.
    #[must_use]
    pub fn display_target(&self) -> String {
        if self.url.is_some() {
            "<url>".to_string()
        } else {
            format!("{}:{}/{}", self.host, self.port, self.db)
        }
    }
}

/// Availability monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between scheduled probes in seconds.
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    /// Single probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive opposite results required to flip status.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u32,

    /// Interval for the manager's drift check in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            probe_timeout_ms: default_probe_timeout_ms(),
            stability_threshold: default_stability_threshold(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_stability_threshold() -> u32 {
    3
}

fn default_reconcile_interval() -> u64 {
    30
}

impl MonitorConfig {
    /// Returns the probe interval as a Duration.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Returns the probe timeout as a Duration.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Returns the reconcile interval as a Duration.
    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Queue behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker job execution timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Attempts per broker job before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Blocking pop timeout for broker workers in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Completed jobs older than this are cleaned (seconds).
    #[serde(default = "default_completed_retention")]
    pub completed_retention_secs: u64,

    /// Failed jobs older than this are cleaned (seconds).
    #[serde(default = "default_failed_retention")]
    pub failed_retention_secs: u64,

    /// Interval of the maintenance task in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// How long maintenance waits for initialization before skipping (ms).
    #[serde(default = "default_ready_wait_ms")]
    pub ready_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            poll_timeout_secs: default_poll_timeout(),
            completed_retention_secs: default_completed_retention(),
            failed_retention_secs: default_failed_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
            ready_wait_ms: default_ready_wait_ms(),
        }
    }
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_poll_timeout() -> u64 {
    1
}

fn default_completed_retention() -> u64 {
    86400 // 24 hours
}

fn default_failed_retention() -> u64 {
    86400 * 7
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_ready_wait_ms() -> u64 {
    5000
}

impl QueueConfig {
    /// Returns the job timeout as a Duration.
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns the completed-job retention as a Duration.
    #[must_use]
    pub const fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    /// Returns the failed-job retention as a Duration.
    #[must_use]
    pub const fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }

    /// Returns the maintenance interval as a Duration.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Returns the readiness wait as a Duration.
    #[must_use]
    pub const fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }
}

/// Dead-letter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Audit directory used when the broker store is unavailable.
    #[serde(default = "default_dead_letter_dir")]
    pub directory: PathBuf,

    /// Records kept by `cleanup` in the broker store.
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,

    /// Liveness check timeout for the broker store in milliseconds.
    #[serde(default = "default_store_ping_timeout")]
    pub ping_timeout_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            directory: default_dead_letter_dir(),
            retention_count: default_retention_count(),
            ping_timeout_ms: default_store_ping_timeout(),
        }
    }
}

fn default_dead_letter_dir() -> PathBuf {
    PathBuf::from("logs/failed-jobs")
}

fn default_retention_count() -> usize {
    100
}

fn default_store_ping_timeout() -> u64 {
    3000
}

impl DeadLetterConfig {
    /// Returns the store ping timeout as a Duration.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}
