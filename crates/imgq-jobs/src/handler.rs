//! Job handler contract.

use crate::error::JobError;
use crate::job::JobDescriptor;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Future returned by a job handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, JobError>>;

/// Job handler function type.
///
/// A handler receives the job and a progress reporter, and returns the job
/// result or an error. Returning an error is the only way a job fails.
pub type JobHandler = Arc<dyn Fn(JobDescriptor, Progress) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure into a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> JobHandler
where
    F: Fn(JobDescriptor, Progress) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    Arc::new(move |job, progress| Box::pin(f(job, progress)))
}

/// Sink for progress updates.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Records a progress value, already clamped to 0-100.
    async fn report(&self, percent: u8);
}

/// Progress reporter handed to job handlers.
#[derive(Clone)]
pub struct Progress {
    sink: Arc<dyn ProgressSink>,
    last: Arc<AtomicU8>,
}

impl Progress {
    /// Creates a reporter writing to `sink`.
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    /// A reporter that only remembers the last value.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalProgress))
    }

    /// Reports progress. Values above 100 are clamped.
    pub async fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.last.store(percent, Ordering::Relaxed);
        self.sink.report(percent).await;
    }

    /// Last reported value.
    pub fn last(&self) -> u8 {
        self.last.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress").field("last", &self.last()).finish()
    }
}

struct LocalProgress;

#[async_trait]
impl ProgressSink for LocalProgress {
    async fn report(&self, percent: u8) {
        tracing::trace!(percent, "Local job progress");
    }
}
