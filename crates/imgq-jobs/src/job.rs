//! Job definitions.

use crate::error::{ErrorDetail, JobError, JobResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Image processing job types. Each type has its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Re-encode at a lower quality.
    Compress,
    /// Scale to new dimensions.
    Resize,
    /// Change the output format.
    Convert,
    /// Cut out a region.
    Crop,
}

impl JobType {
    /// Every job type, in a fixed order.
    pub const ALL: [JobType; 4] = [
        JobType::Compress,
        JobType::Resize,
        JobType::Convert,
        JobType::Crop,
    ];

    /// Queue name for this job type.
    #[must_use]
    pub const fn queue_name(self) -> &'static str {
        match self {
            JobType::Compress => "image-compression",
            JobType::Resize => "image-resize",
            JobType::Convert => "image-conversion",
            JobType::Crop => "image-crop",
        }
    }

    /// Looks a job type up by its queue name.
    pub fn from_queue_name(name: &str) -> JobResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.queue_name() == name)
            .ok_or_else(|| JobError::UnknownJobType(name.to_string()))
    }

    /// Short name, as used in metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JobType::Compress => "compress",
            JobType::Resize => "resize",
            JobType::Convert => "convert",
            JobType::Crop => "crop",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compress" => Ok(JobType::Compress),
            "resize" => Ok(JobType::Resize),
            "convert" => Ok(JobType::Convert),
            "crop" => Ok(JobType::Crop),
            other => JobType::from_queue_name(other),
        }
    }
}

/// A submitted job. The payload is opaque to the queueing core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job ID.
    pub id: JobId,

    /// Job type.
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Job payload, passed to the handler verbatim.
    pub payload: Map<String, Value>,

    /// Webhook notified by the handler layer on completion or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Creates a descriptor with a fresh ID. A `webhookUrl` string entry in the
    /// payload is lifted into `webhook_url`; the payload itself is untouched.
    pub fn new(job_type: JobType, payload: Map<String, Value>) -> Self {
        let webhook_url = payload
            .get("webhookUrl")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            id: JobId::new(),
            job_type,
            payload,
            webhook_url,
            created_at: Utc::now(),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The payload as a JSON value.
    #[must_use]
    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

/// Handle returned to a submitter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Job ID.
    pub id: JobId,

    /// Job type.
    pub job_type: JobType,
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a handler.
    Waiting,
    /// Handler is running.
    Active,
    /// Handler returned a result.
    Completed,
    /// Handler failed terminally.
    Failed,
}

impl JobState {
    /// Returns true for completed and failed jobs.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(JobError::Internal(format!("Unknown job state: {}", other))),
        }
    }
}

/// Job information for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID.
    pub id: JobId,

    /// Job type.
    pub job_type: JobType,

    /// Current state.
    pub state: JobState,

    /// Last reported progress, 0-100.
    pub progress: u8,

    /// Attempts made so far.
    pub attempts: u32,

    /// Handler result for completed jobs.
    pub result: Option<Value>,

    /// Failure detail for failed jobs.
    pub error: Option<ErrorDetail>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job finished.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    /// Creates a waiting entry for a freshly submitted job.
    #[must_use]
    pub fn waiting(job: &JobDescriptor) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type,
            state: JobState::Waiting,
            progress: 0,
            attempts: 0,
            result: None,
            error: None,
            created_at: job.created_at,
            finished_at: None,
        }
    }

    /// Marks the job active and counts the attempt.
    pub fn start(&mut self) {
        self.state = JobState::Active;
        self.attempts += 1;
    }

    /// Marks the job completed.
    pub fn complete(&mut self, result: Value) {
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Marks the job failed.
    pub fn fail(&mut self, error: ErrorDetail) {
        self.state = JobState::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Returns true if the job finished before `threshold` in `state`.
    #[must_use]
    pub fn finished_before(&self, state: JobState, threshold: DateTime<Utc>) -> bool {
        self.state == state && self.finished_at.is_some_and(|at| at < threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_job_type_queue_names_round_trip() {
        for job_type in JobType::ALL {
            assert_eq!(JobType::from_queue_name(job_type.queue_name()).unwrap(), job_type);
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
        }
    }

    #[test]
    fn test_unknown_job_type() {
        let err = "sharpen".parse::<JobType>().unwrap_err();
        assert!(matches!(err, JobError::UnknownJobType(name) if name == "sharpen"));
    }

    #[test]
    fn test_descriptor_lifts_webhook() {
        let job = JobDescriptor::new(
            JobType::Resize,
            payload(json!({
                "filePath": "/tmp/a.png",
                "width": 640,
                "height": 480,
                "webhookUrl": "https://hooks.example.com/done"
            })),
        );

        assert_eq!(job.webhook_url.as_deref(), Some("https://hooks.example.com/done"));
        assert_eq!(job.payload["width"], json!(640));
        assert!(job.payload.contains_key("webhookUrl"));
    }

    #[test]
    fn test_descriptor_json_uses_type_field() {
        let job = JobDescriptor::new(JobType::Crop, payload(json!({"filePath": "/tmp/b.jpg"})));
        let json = job.to_json().unwrap();
        assert!(json.contains("\"type\":\"crop\""));

        let restored = JobDescriptor::from_json(&json).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_job_info_lifecycle() {
        let job = JobDescriptor::new(JobType::Compress, Map::new());
        let mut info = JobInfo::waiting(&job);
        assert_eq!(info.state, JobState::Waiting);

        info.start();
        assert_eq!(info.state, JobState::Active);
        assert_eq!(info.attempts, 1);

        info.complete(json!({"size": 1024}));
        assert_eq!(info.state, JobState::Completed);
        assert_eq!(info.progress, 100);
        assert!(info.finished_at.is_some());
        assert!(info.finished_before(JobState::Completed, Utc::now() + chrono::Duration::seconds(1)));
        assert!(!info.finished_before(JobState::Failed, Utc::now() + chrono::Duration::seconds(1)));
    }
}
