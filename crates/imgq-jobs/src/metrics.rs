//! Metrics for queue health and mode transitions.

use crate::job::JobType;
use crate::queue::QueueMode;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the queueing core.
pub mod names {
    /// Total jobs submitted.
    pub const JOBS_SUBMITTED_TOTAL: &str = "imgq_jobs_submitted_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "imgq_jobs_completed_total";
    /// Total job handler failures, including retried attempts.
    pub const JOBS_FAILED_TOTAL: &str = "imgq_jobs_failed_total";
    /// Total broker job retries.
    pub const JOBS_RETRIED_TOTAL: &str = "imgq_jobs_retried_total";
    /// Total dead-letter records written.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "imgq_jobs_dead_lettered_total";

    /// Current pending jobs.
    pub const JOBS_PENDING: &str = "imgq_jobs_pending";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "imgq_job_duration_seconds";

    /// Broker probe results.
    pub const BROKER_PROBES_TOTAL: &str = "imgq_broker_probes_total";
    /// Broker status, 1 when available.
    pub const BROKER_AVAILABLE: &str = "imgq_broker_available";
    /// Queue manager mode transitions.
    pub const MODE_TRANSITIONS_TOTAL: &str = "imgq_mode_transitions_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_SUBMITTED_TOTAL, "Total number of jobs submitted");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of failed handler attempts"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of broker job retries");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of dead-letter records, by persistence target"
    );

    describe_gauge!(names::JOBS_PENDING, "Current number of pending jobs");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );

    describe_counter!(names::BROKER_PROBES_TOTAL, "Total number of broker probes");
    describe_gauge!(
        names::BROKER_AVAILABLE,
        "Whether the broker is available (1) or not (0)"
    );
    describe_counter!(
        names::MODE_TRANSITIONS_TOTAL,
        "Total number of queue mode transitions"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job submitted.
    pub fn job_submitted(job_type: JobType, mode: QueueMode) {
        counter!(
            names::JOBS_SUBMITTED_TOTAL,
            "job_type" => job_type.as_str(),
            "mode" => mode.as_str()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(job_type: JobType, mode: QueueMode, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "job_type" => job_type.as_str(),
            "mode" => mode.as_str()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.as_str(),
            "mode" => mode.as_str(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed handler attempt.
    pub fn job_failed(job_type: JobType, mode: QueueMode, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_type" => job_type.as_str(),
            "mode" => mode.as_str()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.as_str(),
            "mode" => mode.as_str(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a broker job retry.
    pub fn job_retried(job_type: JobType, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "job_type" => job_type.as_str(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a dead-letter write. `target` is `store` or `file`.
    pub fn job_dead_lettered(queue: &str, target: &'static str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "queue" => queue.to_string(),
            "target" => target
        )
        .increment(1);
    }

    /// Update the pending gauge.
    pub fn update_pending(job_type: JobType, mode: QueueMode, pending: u64) {
        gauge!(
            names::JOBS_PENDING,
            "job_type" => job_type.as_str(),
            "mode" => mode.as_str()
        )
        .set(pending as f64);
    }
}

/// Broker availability recorder.
#[derive(Clone)]
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// Record a probe result.
    pub fn probe(reachable: bool) {
        counter!(
            names::BROKER_PROBES_TOTAL,
            "result" => if reachable { "success" } else { "failure" }
        )
        .increment(1);
    }

    /// Update the status gauge.
    pub fn status(available: bool) {
        gauge!(names::BROKER_AVAILABLE).set(if available { 1.0 } else { 0.0 });
    }

    /// Record a mode transition.
    pub fn transition(to: QueueMode) {
        counter!(names::MODE_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        register_metrics();
    }

    #[test]
    fn test_recorders_without_exporter() {
        JobMetrics::job_submitted(JobType::Compress, QueueMode::Local);
        JobMetrics::job_completed(JobType::Compress, QueueMode::Local, Duration::from_millis(10));
        JobMetrics::job_failed(JobType::Resize, QueueMode::Broker, Duration::from_secs(1));
        JobMetrics::job_dead_lettered("image-resize", "file");
        BrokerMetrics::probe(false);
        BrokerMetrics::status(false);
        BrokerMetrics::transition(QueueMode::Local);
    }
}
