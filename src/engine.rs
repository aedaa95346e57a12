//! The engine facade: job registry, queue, governor, sink and workers.
//!
//! ```no_run
//! use scan_orchestrator::backend::BackendRegistry;
//! use scan_orchestrator::config::AppConfig;
//! use scan_orchestrator::engine::ScanEngine;
//! use scan_orchestrator::job::ScanRequest;
//!
//! # async fn run() -> Result<(), scan_orchestrator::error::ScanError> {
//! let config = AppConfig::default();
//! let engine = ScanEngine::builder(config.engine)
//!     .backends(BackendRegistry::with_defaults(&config.backends))
//!     .start();
//! let created = engine.create_job(ScanRequest::new(["10.0.0.1", "10.0.0.2"]).scanner("fast"))?;
//! engine.wait_for_terminal(created.scan_id).await?;
//! let results = engine.results(created.scan_id, 100, 0)?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{ArcBackend, BackendRegistry};
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, JobQueue};
use crate::error::ScanError;
use crate::governor::{Governor, GovernorSnapshot};
use crate::job::{JobCreated, JobPlan, JobStatus, JobStatusView, ScanJob, ScanRequest};
use crate::scheduler::JobSubmitter;
use crate::sink::{ResultSink, TracingSink};
use crate::types::ScanResult;

/// Paging and filtering for job listings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

fn default_limit() -> usize {
    100
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
            status: None,
        }
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    backends: BackendRegistry,
    sink: Arc<dyn ResultSink>,
}

impl EngineBuilder {
    /// Replace the registry, e.g. with [`BackendRegistry::with_defaults`].
    pub fn backends(mut self, registry: BackendRegistry) -> Self {
        self.backends = registry;
        self
    }

    /// Register one more backend.
    pub fn backend(mut self, backend: ArcBackend) -> Self {
        self.backends.register(backend);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Spawn the dispatcher workers. Must be called inside a Tokio runtime.
    pub fn start(self) -> ScanEngine {
        let governor = Governor::new(
            self.config.max_concurrent_scans,
            self.config.max_concurrent_probes,
        );
        let queue = Arc::new(JobQueue::default());
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            governor.clone(),
            self.sink,
            self.config.per_job_concurrency,
            shutdown.clone(),
        ));
        let workers = (0..self.config.workers.max(1))
            .map(|i| tokio::spawn(dispatcher.clone().run_worker(i)))
            .collect();
        info!(
            workers = self.config.workers,
            max_concurrent_scans = self.config.max_concurrent_scans,
            backends = ?self.backends.names(),
            "scan engine started"
        );
        ScanEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                backends: self.backends,
                governor,
                queue,
                jobs: RwLock::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                shutdown,
                workers: Mutex::new(workers),
            }),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    backends: BackendRegistry,
    governor: Governor,
    queue: Arc<JobQueue>,
    jobs: RwLock<HashMap<Uuid, Arc<ScanJob>>>,
    /// Terminal job ids in completion order.
    finished: Mutex<VecDeque<Uuid>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineInner {
    /// Record a terminal job and evict the oldest ones past `max_finished_jobs`.
    fn retire(&self, id: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut finished = self.finished.lock().unwrap_or_else(|p| p.into_inner());
            finished.push_back(id);
            let excess = finished.len().saturating_sub(self.config.max_finished_jobs);
            finished.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        for id in &evicted {
            jobs.remove(id);
        }
        debug!(evicted = evicted.len(), "evicted finished scans");
    }
}

/// Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct ScanEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine")
            .field("governor", &self.inner.governor.snapshot())
            .field("queued", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

impl ScanEngine {
    /// Builder with no backends and the tracing sink.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            backends: BackendRegistry::new(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.inner.backends.names()
    }

    /// Validate and queue a job.
    pub fn create_job(&self, request: ScanRequest) -> Result<JobCreated, ScanError> {
        Ok(self.enqueue(request, None)?.created())
    }

    /// Queue a job only if it could start right away; otherwise `GovernorExhausted`.
    pub fn try_create_job(&self, request: ScanRequest) -> Result<JobCreated, ScanError> {
        let governor = &self.inner.governor;
        let job = self.enqueue_if(request, None, |waiting| {
            let snapshot = governor.snapshot();
            let free = snapshot
                .max_concurrent_scans
                .saturating_sub(snapshot.running_scans);
            free > waiting
        })?;
        Ok(job.created())
    }

    fn enqueue(&self, request: ScanRequest, schedule_id: Option<Uuid>) -> Result<Arc<ScanJob>, ScanError> {
        self.enqueue_if(request, schedule_id, |_| true)
    }

    fn enqueue_if(
        &self,
        request: ScanRequest,
        schedule_id: Option<Uuid>,
        admit: impl FnOnce(usize) -> bool,
    ) -> Result<Arc<ScanJob>, ScanError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let plan = JobPlan::validate(request, &self.inner.backends, &self.inner.config)?;
        let job = Arc::new(ScanJob::new(plan, schedule_id));
        self.jobs_mut().insert(job.id(), job.clone());
        if !self.inner.queue.push_when(job.clone(), admit) {
            self.jobs_mut().remove(&job.id());
            return Err(ScanError::GovernorExhausted {
                limit: self.inner.governor.snapshot().max_concurrent_scans,
            });
        }
        self.retain_until_evicted(&job);
        debug!(
            scan_id = %job.id(),
            targets = job.total_targets(),
            schedule_id = ?schedule_id,
            "scan queued"
        );
        Ok(job)
    }

    fn jobs_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<ScanJob>>> {
        self.inner.jobs.write().unwrap_or_else(|p| p.into_inner())
    }

    fn retain_until_evicted(&self, job: &ScanJob) {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let id = job.id();
        job.on_complete(move |_| {
            if let Some(engine) = engine.upgrade() {
                engine.retire(id);
            }
        });
    }

    pub fn job(&self, id: Uuid) -> Result<Arc<ScanJob>, ScanError> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| ScanError::scan_not_found(id))
    }

    pub fn status(&self, id: Uuid) -> Result<JobStatusView, ScanError> {
        Ok(self.job(id)?.view())
    }

    pub fn results(&self, id: Uuid, limit: usize, offset: usize) -> Result<Vec<ScanResult>, ScanError> {
        Ok(self.job(id)?.results(limit, offset))
    }

    pub fn cancel(&self, id: Uuid) -> Result<JobStatus, ScanError> {
        let job = self.job(id)?;
        let status = job.cancel()?;
        info!(scan_id = %id, "scan cancelled");
        Ok(status)
    }

    /// Newest first.
    pub fn list(&self, query: &ListQuery) -> Vec<JobStatusView> {
        let mut jobs: Vec<Arc<ScanJob>> = self
            .inner
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        jobs.iter()
            .map(|job| job.view())
            .filter(|view| query.status.map_or(true, |s| view.status == s))
            .skip(query.offset)
            .take(query.limit)
            .collect()
    }

    pub async fn wait_for_terminal(&self, id: Uuid) -> Result<JobStatus, ScanError> {
        let job = self.job(id)?;
        Ok(job.wait_terminal().await)
    }

    pub fn governor(&self) -> GovernorSnapshot {
        self.inner.governor.snapshot()
    }

    pub fn queued_jobs(&self) -> usize {
        self.inner.queue.len()
    }

    /// Resize the scan pool. Running jobs keep their slots.
    pub fn set_max_concurrent_scans(&self, limit: usize) {
        self.inner.governor.set_max_concurrent_scans(limit);
    }

    /// Stop the workers and cancel every job that is not terminal yet.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let jobs: Vec<Arc<ScanJob>> = self
            .inner
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut cancelled = 0usize;
        for job in jobs {
            if job.cancel().is_ok() {
                cancelled += 1;
            }
        }
        let workers = std::mem::take(&mut *self.inner.workers.lock().unwrap_or_else(|p| p.into_inner()));
        for worker in workers {
            let _ = worker.await;
        }
        info!(cancelled, "scan engine stopped");
    }
}

impl JobSubmitter for ScanEngine {
    fn validate(&self, request: &ScanRequest) -> Result<(), ScanError> {
        JobPlan::validate(request.clone(), &self.inner.backends, &self.inner.config).map(|_| ())
    }

    fn submit(&self, request: ScanRequest, schedule_id: Uuid) -> Result<Arc<ScanJob>, ScanError> {
        self.enqueue(request, Some(schedule_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockBehavior};
    use crate::sink::{ChannelSink, NullSink};
    use std::time::Duration;

    fn engine(backend: MockBackend, config: EngineConfig) -> ScanEngine {
        ScanEngine::builder(config).backend(Arc::new(backend)).start()
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let engine = engine(MockBackend::new("mock"), EngineConfig::default());
        assert!(matches!(
            engine.status(Uuid::new_v4()),
            Err(ScanError::NotFound { kind: "scan", .. })
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filters() {
        let engine = engine(
            MockBackend::new("mock").with_default(MockBehavior::Hang),
            EngineConfig {
                max_concurrent_scans: 1,
                ..EngineConfig::default()
            },
        );
        let first = engine.create_job(ScanRequest::new(["10.0.0.1"]).scanner("mock")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = engine.create_job(ScanRequest::new(["10.0.0.2"]).scanner("mock")).unwrap();
        engine.cancel(second.scan_id).unwrap();

        let all = engine.list(&ListQuery::default());
        assert_eq!(all[0].scan_id, second.scan_id);
        assert_eq!(all[1].scan_id, first.scan_id);

        let cancelled = engine.list(&ListQuery {
            status: Some(JobStatus::Cancelled),
            ..ListQuery::default()
        });
        assert_eq!(cancelled.len(), 1);
        engine.shutdown().await;
        assert_eq!(engine.status(first.scan_id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn sink_sees_each_result_once() {
        let (sink, mut rx) = ChannelSink::channel();
        let engine = ScanEngine::builder(EngineConfig::default())
            .backend(Arc::new(MockBackend::new("mock")))
            .sink(Arc::new(sink))
            .start();
        let created = engine
            .create_job(ScanRequest::new(["10.0.0.0/29"]).scanner("mock"))
            .unwrap();
        assert_eq!(engine.wait_for_terminal(created.scan_id).await.unwrap(), JobStatus::Completed);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.scan_id, created.scan_id);
            seen.push(event.result.target.to_string());
        }
        seen.sort();
        let before = seen.len();
        seen.dedup();
        assert_eq!(before, 6);
        assert_eq!(seen.len(), 6);
    }

    #[tokio::test]
    async fn try_create_reports_exhaustion() {
        let engine = engine(
            MockBackend::new("mock").with_default(MockBehavior::Hang),
            EngineConfig {
                max_concurrent_scans: 1,
                ..EngineConfig::default()
            },
        );
        let first = engine.try_create_job(ScanRequest::new(["10.0.0.1"]).scanner("mock")).unwrap();
        assert_eq!(first.status, JobStatus::Queued);
        let err = engine
            .try_create_job(ScanRequest::new(["10.0.0.2"]).scanner("mock"))
            .unwrap_err();
        assert_eq!(err, ScanError::GovernorExhausted { limit: 1 });
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_jobs() {
        let engine = engine(MockBackend::new("mock"), EngineConfig::default());
        engine.shutdown().await;
        assert!(matches!(
            engine.create_job(ScanRequest::new(["10.0.0.1"]).scanner("mock")),
            Err(ScanError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn raising_the_scan_limit_admits_queued_jobs() {
        let engine = ScanEngine::builder(EngineConfig {
            max_concurrent_scans: 1,
            ..EngineConfig::default()
        })
        .backend(Arc::new(MockBackend::new("mock").with_default(MockBehavior::Hang)))
        .sink(Arc::new(NullSink))
        .start();
        let first = engine.create_job(ScanRequest::new(["10.0.0.1"]).scanner("mock")).unwrap();
        let second = engine.create_job(ScanRequest::new(["10.0.0.2"]).scanner("mock")).unwrap();
        for _ in 0..1_000 {
            if engine.status(first.scan_id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(engine.status(second.scan_id).unwrap().status, JobStatus::Queued);

        engine.set_max_concurrent_scans(2);
        for _ in 0..1_000 {
            if engine.status(second.scan_id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(engine.status(second.scan_id).unwrap().status, JobStatus::Running);
        assert_eq!(engine.governor().running_scans, 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn oldest_finished_jobs_are_evicted() {
        let engine = engine(
            MockBackend::new("mock"),
            EngineConfig {
                max_finished_jobs: 2,
                ..EngineConfig::default()
            },
        );
        let mut ids = Vec::new();
        for target in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let created = engine.create_job(ScanRequest::new([target]).scanner("mock")).unwrap();
            assert_eq!(engine.wait_for_terminal(created.scan_id).await.unwrap(), JobStatus::Completed);
            ids.push(created.scan_id);
        }

        assert!(matches!(
            engine.status(ids[0]),
            Err(ScanError::NotFound { kind: "scan", .. })
        ));
        assert_eq!(engine.results(ids[1], 10, 0).unwrap().len(), 1);
        assert_eq!(engine.status(ids[2]).unwrap().status, JobStatus::Completed);
        assert_eq!(engine.list(&ListQuery::default()).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_try_create_admits_one_job_per_free_slot() {
        let engine = engine(
            MockBackend::new("mock").with_default(MockBehavior::Hang),
            EngineConfig {
                max_concurrent_scans: 1,
                ..EngineConfig::default()
            },
        );
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let attempts: Vec<_> = (1..=16)
            .map(|i| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    engine.try_create_job(ScanRequest::new([format!("10.0.0.{i}")]).scanner("mock"))
                })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(err) => assert_eq!(err, ScanError::GovernorExhausted { limit: 1 }),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(engine.list(&ListQuery::default()).len(), 1);
        engine.shutdown().await;
    }
}
