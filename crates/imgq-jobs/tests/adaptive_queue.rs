//! End-to-end behaviour of the adaptive queue against an in-process broker.

mod common;

use common::{eventually, FakeBroker};
use imgq_config::{AppConfig, DeadLetterConfig, MonitorConfig, QueueConfig};
use imgq_jobs::{
    handler_fn, Broker, BrokerAvailabilityMonitor, BrokerProbe, BrokerStatus, ConnectivityKind,
    DeadLetterRecord, DeadLetterRecorder, ErrorDetail, InMemoryQueue, JobDescriptor, JobError,
    JobId, JobQueue, JobState, JobType, ManagerState, QueueManager, QueueMode, QueueRuntime,
    StatusEvent, StatusTracker,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;

const WAIT: Duration = Duration::from_secs(3);

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn as_broker(broker: &Arc<FakeBroker>) -> Arc<dyn Broker> {
    Arc::clone(broker) as Arc<dyn Broker>
}

fn manager_for(
    broker: &Arc<FakeBroker>,
    tracker: &Arc<StatusTracker>,
    recorder: Option<Arc<DeadLetterRecorder>>,
) -> Arc<QueueManager> {
    Arc::new(QueueManager::new(
        Some(as_broker(broker)),
        Arc::clone(tracker),
        recorder,
        QueueConfig::default(),
    ))
}

fn recorder_for(dir: &Path, broker: Option<Arc<dyn Broker>>) -> Arc<DeadLetterRecorder> {
    let config = DeadLetterConfig {
        directory: dir.to_path_buf(),
        ..DeadLetterConfig::default()
    };
    Arc::new(DeadLetterRecorder::new(&config, broker))
}

fn audit_files(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(Result::ok).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn three_successful_probes_flip_to_available_once() {
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::new(BrokerStatus::Unavailable, 3));
    let monitor = BrokerAvailabilityMonitor::new(
        Arc::new(BrokerProbe::new(as_broker(&broker))),
        Arc::clone(&tracker),
        &MonitorConfig::default(),
    );
    let mut events = tracker.subscribe();

    assert_eq!(monitor.check().await, None);
    assert_eq!(monitor.check().await, None);
    assert_eq!(monitor.check().await, Some(BrokerStatus::Available));

    assert_eq!(tracker.status(), BrokerStatus::Available);
    assert_eq!(events.try_recv().unwrap(), StatusEvent::Changed(BrokerStatus::Available));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    // Further confirmations stay silent.
    assert_eq!(monitor.check().await, None);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn alternating_probes_never_flip() {
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::new(BrokerStatus::Available, 3));
    let monitor = BrokerAvailabilityMonitor::new(
        Arc::new(BrokerProbe::new(as_broker(&broker))),
        Arc::clone(&tracker),
        &MonitorConfig::default(),
    );
    let mut events = tracker.subscribe();

    for up in [false, true, false, true] {
        broker.set_up(up);
        assert_eq!(monitor.check().await, None);
    }

    assert_eq!(tracker.status(), BrokerStatus::Available);
    assert_eq!(broker.probes(), 4);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn local_queue_runs_jobs_one_at_a_time_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    let handler = {
        let order = Arc::clone(&order);
        let in_flight = Arc::clone(&in_flight);
        let overlapped = Arc::clone(&overlapped);
        handler_fn(move |job, _progress| {
            let order = Arc::clone(&order);
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            async move {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().push(job.payload_value()["n"].as_u64().unwrap_or(u64::MAX));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    };

    let queue = InMemoryQueue::new(JobType::Compress, None);
    assert!(queue.register_handler(handler));

    let started = Instant::now();
    for n in 0..5 {
        queue
            .submit(JobDescriptor::new(JobType::Compress, payload(json!({ "n": n }))))
            .await
            .unwrap();
    }

    assert!(eventually(WAIT, || async { order.lock().len() == 5 }).await);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    assert!(!overlapped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn connection_error_on_submit_moves_status_without_a_probe() {
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::new(BrokerStatus::Available, 3));
    let manager = manager_for(&broker, &tracker, None);
    let _listener = manager.spawn_status_listener();
    let mut events = tracker.subscribe();

    assert_eq!(manager.initialize().await, ManagerState::ActiveBroker);
    assert_eq!(broker.probes(), 1);

    broker.set_up(false);
    let handle = manager
        .submit(JobType::Crop, payload(json!({ "filePath": "a.png", "left": 0, "top": 0 })))
        .await
        .unwrap();

    assert_eq!(tracker.snapshot().consecutive_failures, 1);
    assert_eq!(
        events.try_recv().unwrap(),
        StatusEvent::ConnectionError(ConnectivityKind::Refused)
    );
    assert_eq!(broker.probes(), 1);

    assert_eq!(manager.mode(), Some(QueueMode::Local));
    assert!(eventually(WAIT, || async { broker.queues_closed() == 4 }).await);

    let info = manager.get_status(&handle).await.unwrap().unwrap();
    assert_eq!(info.state, JobState::Waiting);

    manager.shutdown().await;
}

#[tokio::test]
async fn duplicate_record_calls_create_two_records() {
    let dir = tempfile::tempdir().unwrap();
    let broker = FakeBroker::new(true);
    let recorder = recorder_for(dir.path(), Some(as_broker(&broker)));
    assert!(recorder.connect().await);

    let job_id = JobId::new();
    let error = ErrorDetail::from(&JobError::handler("decode failed"));

    let first = recorder
        .record("image-resize", &job_id, json!({ "width": 10 }), error.clone())
        .await;
    let second = recorder
        .record("image-resize", &job_id, json!({ "width": 10 }), error)
        .await;

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first, second);
    assert_eq!(broker.store().records().len(), 2);
    assert!(audit_files(dir.path()).is_empty());
}

#[tokio::test]
async fn unavailable_store_writes_exactly_one_file_per_failure() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("failed-jobs");
    let recorder = recorder_for(&audit, None);

    let job_id = JobId::from_string("job-7");
    let error = ErrorDetail {
        message: "unsupported format".to_string(),
        stack: None,
        code: Some("BAD_FORMAT".to_string()),
    };
    let id = recorder
        .record("image-conversion", &job_id, json!({ "format": "tiff" }), error.clone())
        .await;
    assert!(id.is_none());

    let files = audit_files(&audit);
    assert_eq!(files.len(), 1);

    let body = std::fs::read_to_string(&files[0]).unwrap();
    let record: DeadLetterRecord = serde_json::from_str(&body).unwrap();
    assert_eq!(record.original_queue_name, "image-conversion");
    assert_eq!(record.original_job_id, job_id);
    assert_eq!(record.payload, json!({ "format": "tiff" }));
    assert_eq!(record.error, error);
}

#[tokio::test]
async fn store_failing_at_use_time_falls_back_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let broker = FakeBroker::new(true);
    let recorder = recorder_for(dir.path(), Some(as_broker(&broker)));
    assert!(recorder.connect().await);

    broker.set_up(false);
    let id = recorder
        .record(
            "image-crop",
            &JobId::new(),
            json!({}),
            ErrorDetail::from(&JobError::handler("boom")),
        )
        .await;

    assert!(id.is_none());
    assert!(broker.store().records().is_empty());
    assert_eq!(audit_files(dir.path()).len(), 1);
}

#[tokio::test]
async fn registering_twice_processes_each_job_once() {
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::default());
    let manager = manager_for(&broker, &tracker, None);
    manager.initialize().await;

    let calls = Arc::new(AtomicU32::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        handler_fn(move |_job, _progress| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    };

    assert!(manager.register_handler(JobType::Resize, handler.clone()).await);
    assert!(!manager.register_handler(JobType::Resize, handler).await);

    for width in [100, 200, 300] {
        manager
            .submit(JobType::Resize, payload(json!({ "width": width })))
            .await
            .unwrap();
    }

    assert!(eventually(WAIT, || async { calls.load(Ordering::SeqCst) == 3 }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn swap_to_broker_drains_local_jobs_exactly_once() {
    let broker = FakeBroker::new(false);
    let tracker = Arc::new(StatusTracker::new(BrokerStatus::Unavailable, 3));
    let manager = manager_for(&broker, &tracker, None);
    let _listener = manager.spawn_status_listener();

    assert_eq!(manager.initialize().await, ManagerState::ActiveLocal);

    let seen: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |job, _progress| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                *seen.lock().entry(job.id.to_string()).or_insert(0) += 1;
                Ok(Value::Null)
            }
        })
    };
    manager.register_handler(JobType::Convert, handler).await;

    let mut local_handles = Vec::new();
    for n in 0..3 {
        let handle = manager
            .submit(JobType::Convert, payload(json!({ "n": n })))
            .await
            .unwrap();
        local_handles.push(handle);
    }

    broker.set_up(true);
    for _ in 0..3 {
        tracker.record_success();
    }
    assert!(eventually(WAIT, || async { manager.mode() == Some(QueueMode::Broker) }).await);
    assert!(manager.handler_attached(JobType::Convert));

    for n in 3..5 {
        manager
            .submit(JobType::Convert, payload(json!({ "n": n })))
            .await
            .unwrap();
    }

    assert!(eventually(WAIT, || async { seen.lock().len() == 5 }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().values().all(|count| *count == 1));

    for handle in &local_handles {
        let info = manager.get_status(handle).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Completed);
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn unavailable_status_moves_broker_to_local() {
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::new(BrokerStatus::Available, 3));
    let manager = manager_for(&broker, &tracker, None);
    let _listener = manager.spawn_status_listener();

    assert_eq!(manager.initialize().await, ManagerState::ActiveBroker);

    broker.set_up(false);
    assert_eq!(tracker.record_failure(), None);
    assert_eq!(tracker.record_failure(), None);
    assert_eq!(tracker.record_failure(), Some(BrokerStatus::Unavailable));

    assert!(eventually(WAIT, || async { manager.mode() == Some(QueueMode::Local) }).await);
    assert_eq!(broker.queues_closed(), 4);
    assert_eq!(broker.probes(), 1);

    let handle = manager
        .submit(JobType::Resize, payload(json!({ "width": 320 })))
        .await
        .unwrap();
    let info = manager.get_status(&handle).await.unwrap().unwrap();
    assert_eq!(info.state, JobState::Waiting);

    manager.shutdown().await;
}

#[tokio::test]
async fn reconcile_returns_to_broker_after_connection_error() {
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::new(BrokerStatus::Available, 3));
    let manager = manager_for(&broker, &tracker, None);

    assert_eq!(manager.initialize().await, ManagerState::ActiveBroker);
    assert_eq!(manager.reconcile().await, None);

    // One hot-path error switches the manager but not the shared status.
    broker.set_up(false);
    manager.submit(JobType::Compress, Map::new()).await.unwrap();
    assert_eq!(manager.mode(), Some(QueueMode::Local));
    assert_eq!(tracker.status(), BrokerStatus::Available);

    broker.set_up(true);
    assert_eq!(manager.reconcile().await, Some(QueueMode::Broker));
    assert_eq!(manager.mode(), Some(QueueMode::Broker));

    // Same drift again, corrected by the periodic task this time.
    broker.set_up(false);
    manager.submit(JobType::Compress, Map::new()).await.unwrap();
    assert_eq!(manager.mode(), Some(QueueMode::Local));
    assert_eq!(tracker.status(), BrokerStatus::Available);

    broker.set_up(true);
    let _reconciler = manager.spawn_reconciler(Duration::from_millis(20));
    assert!(eventually(WAIT, || async { manager.mode() == Some(QueueMode::Broker) }).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn broker_queues_close_concurrently_during_swap() {
    let close_delay = Duration::from_millis(200);
    let broker = FakeBroker::new(true);
    broker.set_close_delay(close_delay);
    let tracker = Arc::new(StatusTracker::new(BrokerStatus::Available, 3));
    let manager = manager_for(&broker, &tracker, None);

    assert_eq!(manager.initialize().await, ManagerState::ActiveBroker);
    manager
        .register_handler(JobType::Resize, handler_fn(|_job, _progress| async { Ok(Value::Null) }))
        .await;
    assert!(manager.handler_attached(JobType::Resize));

    broker.set_up(false);
    let swap = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.transition(QueueMode::Local).await })
    };

    assert!(eventually(WAIT, || async { manager.state() == ManagerState::Initializing }).await);
    assert!(!manager.handler_attached(JobType::Resize));

    let started = Instant::now();
    manager
        .submit(JobType::Resize, payload(json!({ "width": 64 })))
        .await
        .unwrap();
    assert!(started.elapsed() < close_delay * 3);

    assert_eq!(swap.await.unwrap(), Some(QueueMode::Local));
    assert_eq!(broker.queues_closed(), 4);
    assert!(manager.handler_attached(JobType::Resize));

    manager.shutdown().await;
}

#[tokio::test]
async fn partial_broker_construction_closes_opened_queues() {
    let broker = FakeBroker::new(true);
    broker.fail_open(Some(JobType::Convert));
    let tracker = Arc::new(StatusTracker::default());
    let manager = manager_for(&broker, &tracker, None);

    assert_eq!(manager.initialize().await, ManagerState::ActiveLocal);
    assert_eq!(broker.queues_opened(), 2);
    assert_eq!(broker.queues_closed(), 2);
    assert!(!manager.is_available().await);
}

#[tokio::test]
async fn submit_before_initialize_waits_for_a_queue_set() {
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::default());
    let manager = manager_for(&broker, &tracker, None);

    let (a, b) = tokio::join!(
        manager.submit(JobType::Compress, payload(json!({ "quality": 80 }))),
        manager.is_available(),
    );

    assert!(a.is_ok());
    assert!(b);
    assert_eq!(broker.probes(), 1);
}

#[tokio::test]
async fn failed_job_can_be_retried_from_the_dead_letter_store() {
    let dir = tempfile::tempdir().unwrap();
    let broker = FakeBroker::new(true);
    let tracker = Arc::new(StatusTracker::default());
    let recorder = recorder_for(dir.path(), Some(as_broker(&broker)));
    assert!(recorder.connect().await);
    let manager = manager_for(&broker, &tracker, Some(Arc::clone(&recorder)));

    let healthy = Arc::new(AtomicBool::new(false));
    let successes = Arc::new(AtomicU32::new(0));
    let handler = {
        let healthy = Arc::clone(&healthy);
        let successes = Arc::clone(&successes);
        handler_fn(move |_job, _progress| {
            let healthy = Arc::clone(&healthy);
            let successes = Arc::clone(&successes);
            async move {
                if healthy.load(Ordering::SeqCst) {
                    successes.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                } else {
                    Err(JobError::handler("source image missing"))
                }
            }
        })
    };
    manager.register_handler(JobType::Resize, handler).await;

    manager
        .submit(JobType::Resize, payload(json!({ "filePath": "b.png", "width": 64 })))
        .await
        .unwrap();
    assert!(eventually(WAIT, || async { broker.store().records().len() == 1 }).await);

    let record = broker.store().records().remove(0);
    assert_eq!(record.original_queue_name, "image-resize");
    assert_eq!(record.payload["width"], json!(64));

    assert!(!manager.retry_dead_letter(&record.id, "image-crop").await);
    assert!(!manager.retry_dead_letter("missing", "image-resize").await);

    healthy.store(true, Ordering::SeqCst);
    assert!(manager.retry_dead_letter(&record.id, "image-resize").await);
    assert!(eventually(WAIT, || async { successes.load(Ordering::SeqCst) == 1 }).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn runtime_follows_broker_availability() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.dead_letter.directory = dir.path().to_path_buf();

    let broker = FakeBroker::new(false);
    let runtime = QueueRuntime::start(&config, Some(as_broker(&broker)));
    let manager = Arc::clone(runtime.manager());

    manager.await_ready().await;
    assert_eq!(manager.state(), ManagerState::ActiveLocal);
    assert!(!runtime.recorder().is_durable());

    broker.set_up(true);
    let monitor = runtime.monitor().unwrap();
    for _ in 0..3 {
        monitor.check().await;
    }
    assert_eq!(runtime.tracker().status(), BrokerStatus::Available);
    assert!(eventually(WAIT, || async { manager.mode() == Some(QueueMode::Broker) }).await);
    assert!(eventually(WAIT, || async { runtime.recorder().is_durable() }).await);

    broker.set_up(false);
    let handle = manager.submit(JobType::Crop, Map::new()).await.unwrap();
    assert_eq!(manager.mode(), Some(QueueMode::Local));
    assert!(manager.get_status(&handle).await.unwrap().is_some());

    runtime.shutdown().await;
}
