use std::sync::Arc;
use std::time::Duration;

use scan_orchestrator::backend::{MockBackend, MockBehavior, RetryPolicy};
use scan_orchestrator::config::EngineConfig;
use scan_orchestrator::engine::{ListQuery, ScanEngine};
use scan_orchestrator::error::ScanError;
use scan_orchestrator::job::{JobStatus, ScanRequest};
use scan_orchestrator::types::TargetOutcome;

fn start(backend: Arc<MockBackend>, config: EngineConfig) -> ScanEngine {
    ScanEngine::builder(config).backend(backend).start()
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn two_targets_end_to_end() {
    let engine = start(
        MockBackend::new("fast").with_default(MockBehavior::Open(vec![22, 80])).into_arc(),
        EngineConfig::default(),
    );
    let created = engine
        .create_job(ScanRequest::new(["10.0.0.1", "10.0.0.2"]).scanner("fast").timeout_secs(30))
        .unwrap();
    assert_eq!(created.status, JobStatus::Queued);

    assert_eq!(engine.wait_for_terminal(created.scan_id).await.unwrap(), JobStatus::Completed);

    let view = engine.status(created.scan_id).unwrap();
    assert_eq!(view.progress, 100);
    assert_eq!(view.results_count, 2);
    assert!(view.error.is_none());
    let started = view.started_at.unwrap();
    assert!(view.completed_at.unwrap() >= started);

    let results = engine.results(created.scan_id, 100, 0).unwrap();
    assert_eq!(results.len(), 2);
    for r in &results {
        assert!(r.success);
        assert!(r.completed_at >= started);
        assert_eq!(r.open_ports.len(), 2);
    }
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn running_jobs_never_exceed_the_scan_limit() {
    let backend = MockBackend::new("mock")
        .with_latency(Duration::from_millis(200))
        .into_arc();
    let engine = start(
        backend,
        EngineConfig {
            max_concurrent_scans: 2,
            ..EngineConfig::default()
        },
    );
    let ids: Vec<_> = (1..=3)
        .map(|i| {
            engine
                .create_job(ScanRequest::new([format!("10.0.0.{i}")]).scanner("mock"))
                .unwrap()
                .scan_id
        })
        .collect();

    let mut peak = 0;
    wait_until(|| {
        let running = engine
            .list(&ListQuery {
                status: Some(JobStatus::Running),
                ..ListQuery::default()
            })
            .len();
        peak = peak.max(running);
        assert!(engine.governor().running_scans <= 2);
        ids.iter()
            .all(|id| engine.status(*id).unwrap().status.is_terminal())
    })
    .await;
    assert_eq!(peak, 2);

    let views: Vec<_> = ids.iter().map(|id| engine.status(*id).unwrap()).collect();
    let first_done = views[..2]
        .iter()
        .filter_map(|v| v.completed_at)
        .min()
        .unwrap();
    assert!(views[2].started_at.unwrap() >= first_done);
    engine.shutdown().await;
}

#[tokio::test]
async fn cancelled_queued_job_never_runs() {
    let engine = start(
        MockBackend::new("mock").with_default(MockBehavior::Hang).into_arc(),
        EngineConfig {
            max_concurrent_scans: 1,
            ..EngineConfig::default()
        },
    );
    let blocker = engine.create_job(ScanRequest::new(["10.0.0.1"]).scanner("mock")).unwrap();
    let queued = engine.create_job(ScanRequest::new(["10.0.0.2"]).scanner("mock")).unwrap();

    wait_until(|| engine.status(blocker.scan_id).unwrap().status == JobStatus::Running).await;
    assert_eq!(engine.cancel(queued.scan_id).unwrap(), JobStatus::Cancelled);

    engine.cancel(blocker.scan_id).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = engine.status(queued.scan_id).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.started_at.is_none());
    assert_eq!(view.results_count, 0);
    assert_eq!(engine.governor().running_scans, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn cancelling_twice_reports_terminal_state() {
    let engine = start(
        MockBackend::new("mock").with_default(MockBehavior::Hang).into_arc(),
        EngineConfig::default(),
    );
    let job = engine.create_job(ScanRequest::new(["10.0.0.1"]).scanner("mock")).unwrap();
    wait_until(|| engine.status(job.scan_id).unwrap().status == JobStatus::Running).await;

    engine.cancel(job.scan_id).unwrap();
    assert_eq!(engine.wait_for_terminal(job.scan_id).await.unwrap(), JobStatus::Cancelled);
    assert_eq!(
        engine.cancel(job.scan_id).unwrap_err(),
        ScanError::AlreadyTerminal {
            status: "cancelled".into()
        }
    );
    assert!(engine.results(job.scan_id, 100, 0).unwrap().is_empty());
    assert!(serde_json::from_str::<TargetOutcome>("\"cancelled\"").is_err());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn progress_only_moves_forward() {
    let engine = start(
        MockBackend::new("mock")
            .with_latency(Duration::from_millis(10))
            .into_arc(),
        EngineConfig {
            per_job_concurrency: 1,
            ..EngineConfig::default()
        },
    );
    let job = engine
        .create_job(ScanRequest::new(["10.0.1.1-20"]).scanner("mock"))
        .unwrap();

    let mut seen = Vec::new();
    wait_until(|| {
        let view = engine.status(job.scan_id).unwrap();
        seen.push(view.progress);
        view.status.is_terminal()
    })
    .await;

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
    assert_eq!(seen.last(), Some(&100));
    assert_eq!(engine.status(job.scan_id).unwrap().results_count, 20);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_then_recorded_as_permanent() {
    let backend = MockBackend::new("mock")
        .with_retry(RetryPolicy::detailed_probe())
        .with_script("10.0.0.2", vec![MockBehavior::Transient])
        .with_script("10.0.0.3", vec![MockBehavior::Transient, MockBehavior::Open(vec![443])])
        .into_arc();
    let engine = start(backend.clone(), EngineConfig::default());
    let job = engine
        .create_job(ScanRequest::new(["10.0.0.1", "10.0.0.2", "10.0.0.3"]).scanner("mock"))
        .unwrap();

    assert_eq!(engine.wait_for_terminal(job.scan_id).await.unwrap(), JobStatus::Completed);
    let view = engine.status(job.scan_id).unwrap();
    assert!(view.completed_with_errors);
    assert_eq!(view.error.as_deref(), Some("1 of 3 targets failed"));

    let results = engine.results(job.scan_id, 100, 0).unwrap();
    let failed = results
        .iter()
        .find(|r| r.target.to_string() == "10.0.0.2")
        .unwrap();
    assert_eq!(failed.outcome, TargetOutcome::Failed);
    assert_eq!(failed.attempts, 4);
    assert_eq!(backend.attempts_for("10.0.0.2"), 4);

    let recovered = results
        .iter()
        .find(|r| r.target.to_string() == "10.0.0.3")
        .unwrap();
    assert!(recovered.success);
    assert_eq!(recovered.attempts, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn job_with_no_successes_fails() {
    let engine = start(
        MockBackend::new("mock")
            .with_default(MockBehavior::Permanent("host unreachable".into()))
            .into_arc(),
        EngineConfig::default(),
    );
    let job = engine
        .create_job(ScanRequest::new(["10.0.0.1", "10.0.0.2"]).scanner("mock"))
        .unwrap();

    assert_eq!(engine.wait_for_terminal(job.scan_id).await.unwrap(), JobStatus::Failed);
    let view = engine.status(job.scan_id).unwrap();
    assert_eq!(
        view.error.as_deref(),
        Some("all 2 targets failed (2 permanent, 0 timed out)")
    );
    assert!(!view.completed_with_errors);
    assert_eq!(view.results_count, 2);
}

#[tokio::test(start_paused = true)]
async fn job_timeout_marks_unfinished_targets() {
    let engine = start(
        MockBackend::new("mock")
            .with_default(MockBehavior::Hang)
            .with_timeout(Duration::from_secs(60))
            .into_arc(),
        EngineConfig::default(),
    );
    let job = engine
        .create_job(ScanRequest::new(["10.0.0.1", "10.0.0.2"]).scanner("mock").timeout_secs(2))
        .unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(engine.wait_for_terminal(job.scan_id).await.unwrap(), JobStatus::Failed);
    assert!(started.elapsed() < Duration::from_secs(60));

    let view = engine.status(job.scan_id).unwrap();
    let error = view.error.unwrap();
    assert!(error.starts_with("job timed out after 2s"), "{error}");
    let results = engine.results(job.scan_id, 100, 0).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.outcome == TargetOutcome::TimedOut));
}

#[tokio::test(start_paused = true)]
async fn job_timeout_keeps_partial_results_and_marks_unstarted_targets() {
    let engine = start(
        MockBackend::new("mock")
            .with_default(MockBehavior::Hang)
            .with_script("10.0.0.1", vec![MockBehavior::Open(vec![22])])
            .with_timeout(Duration::from_secs(60))
            .into_arc(),
        EngineConfig {
            per_job_concurrency: 1,
            ..EngineConfig::default()
        },
    );
    let job = engine
        .create_job(ScanRequest::new(["10.0.0.1-4"]).scanner("mock").timeout_secs(2))
        .unwrap();

    assert_eq!(engine.wait_for_terminal(job.scan_id).await.unwrap(), JobStatus::Completed);
    let view = engine.status(job.scan_id).unwrap();
    assert!(view.completed_with_errors);
    assert_eq!(view.error.as_deref(), Some("job timed out after 2s; 3 of 4 targets failed"));
    assert_eq!(view.progress, 100);

    let results = engine.results(job.scan_id, 100, 0).unwrap();
    assert_eq!(results.len(), 4);
    let succeeded: Vec<_> = results
        .iter()
        .filter(|r| r.outcome == TargetOutcome::Succeeded)
        .collect();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].target.to_string(), "10.0.0.1");
    assert!(results
        .iter()
        .any(|r| r.outcome == TargetOutcome::TimedOut && r.attempts == 0));
    engine.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_queueing() {
    let engine = start(MockBackend::new("mock").into_arc(), EngineConfig::default());

    let unknown = engine.create_job(ScanRequest::new(["10.0.0.1"]).scanner("nope"));
    assert!(matches!(unknown, Err(ScanError::Configuration(_))));

    let bad_target = engine.create_job(ScanRequest::new(["10.0.0.1", "10.0.0.999"]).scanner("mock"));
    assert!(matches!(
        bad_target,
        Err(ScanError::InvalidTarget { ref target, .. }) if target == "10.0.0.999"
    ));

    let everything_excluded = engine.create_job(
        ScanRequest::new(["10.0.0.1"])
            .scanner("mock")
            .exclude(["10.0.0.0/24"]),
    );
    assert!(matches!(everything_excluded, Err(ScanError::InvalidTarget { .. })));

    assert!(engine.list(&ListQuery::default()).is_empty());
    assert_eq!(engine.queued_jobs(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn oversize_jobs_hit_the_target_cap() {
    let engine = start(
        MockBackend::new("mock").into_arc(),
        EngineConfig {
            max_targets_per_job: 100,
            ..EngineConfig::default()
        },
    );
    let err = engine
        .create_job(ScanRequest::new(["10.0.0.0/16"]).scanner("mock"))
        .unwrap_err();
    assert!(matches!(err, ScanError::Configuration(_)));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn per_job_concurrency_caps_in_flight_probes() {
    let backend = MockBackend::new("mock")
        .with_latency(Duration::from_millis(50))
        .into_arc();
    let engine = start(
        backend.clone(),
        EngineConfig {
            per_job_concurrency: 4,
            default_rate_limit: 1000,
            ..EngineConfig::default()
        },
    );
    let job = engine
        .create_job(ScanRequest::new(["10.0.2.0/27"]).scanner("mock"))
        .unwrap();
    assert_eq!(engine.wait_for_terminal(job.scan_id).await.unwrap(), JobStatus::Completed);
    assert!(backend.peak_in_flight() <= 4);
    assert_eq!(engine.status(job.scan_id).unwrap().results_count, 30);
}
