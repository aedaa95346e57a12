//! Scan jobs and their state machine.
//!
//! ```text
//! Queued ──► Running ──► Completed | Failed
//!   │           │
//!   └───────────┴──────► Cancelled
//! ```
//!
//! Every transition is a compare-and-set under the job's write lock, so a
//! cancel racing natural completion has exactly one winner. Terminal states
//! never change again.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ArcBackend, BackendRegistry, ScanType};
use crate::config::EngineConfig;
use crate::error::ScanError;
use crate::ports;
use crate::targets::{Target, TargetSet};
use crate::types::{rfc3339, ScanResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ScanError::configuration(format!("unknown job status '{other}'"))),
        }
    }
}

/// How many candidates expansion may look at per allowed target before a
/// request is refused.
const EXAMINED_PER_TARGET: usize = 4;

fn default_scanner() -> String {
    "detailed".to_string()
}

/// What a caller asks for when creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub targets: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub scan_type: ScanType,
    #[serde(default)]
    pub ports: Option<Vec<u32>>,
    #[serde(default = "default_scanner")]
    pub scanner: String,
    /// Job timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Probes per second.
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl ScanRequest {
    pub fn new<S: Into<String>>(targets: impl IntoIterator<Item = S>) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
            scan_type: ScanType::default(),
            ports: None,
            scanner: default_scanner(),
            timeout: None,
            rate_limit: None,
        }
    }

    pub fn scanner(mut self, scanner: impl Into<String>) -> Self {
        self.scanner = scanner.into();
        self
    }

    pub fn scan_type(mut self, scan_type: ScanType) -> Self {
        self.scan_type = scan_type;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn rate_limit(mut self, rate: u32) -> Self {
        self.rate_limit = Some(rate);
        self
    }

    pub fn ports(mut self, ports: Vec<u32>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn exclude<S: Into<String>>(mut self, exclude: impl IntoIterator<Item = S>) -> Self {
        self.exclude = exclude.into_iter().map(Into::into).collect();
        self
    }
}

/// Resolved per-job options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub scan_type: ScanType,
    /// Empty means the backend's default list.
    pub ports: Vec<u16>,
    pub timeout: Duration,
    pub rate_limit: u32,
}

/// A request that passed validation, ready to become a [`ScanJob`].
#[derive(Debug)]
pub struct JobPlan {
    request: ScanRequest,
    backend: ArcBackend,
    options: JobOptions,
    targets: TargetSet,
    total_targets: usize,
}

impl JobPlan {
    /// Validate a request. Every error here is raised before anything is queued.
    pub fn validate(
        request: ScanRequest,
        backends: &BackendRegistry,
        engine: &EngineConfig,
    ) -> Result<Self, ScanError> {
        let backend = backends.resolve(&request.scanner)?;
        if !backend.supports(request.scan_type) {
            return Err(ScanError::configuration(format!(
                "scanner '{}' does not support {:?}",
                backend.name(),
                request.scan_type
            )));
        }
        let ports = match &request.ports {
            Some(list) => ports::normalize_ports(list)?,
            None => Vec::new(),
        };
        let rate_limit = request.rate_limit.unwrap_or(engine.default_rate_limit);
        if rate_limit == 0 {
            return Err(ScanError::configuration("rate_limit must be at least 1"));
        }
        let timeout = match request.timeout {
            Some(0) => return Err(ScanError::configuration("timeout must be greater than 0")),
            Some(secs) => Duration::from_secs(secs),
            None => engine.default_timeout(),
        };

        let targets = TargetSet::parse(&request.targets, &request.exclude)?;
        let total_targets = targets.count_bounded(
            engine.max_targets_per_job,
            engine.max_targets_per_job.saturating_mul(EXAMINED_PER_TARGET),
        )?;
        if total_targets > engine.max_targets_per_job {
            return Err(ScanError::configuration(format!(
                "job expands to more than {} targets",
                engine.max_targets_per_job
            )));
        }
        if total_targets == 0 {
            return Err(ScanError::invalid_target(
                request.targets.join(","),
                "no targets left after exclusions",
            ));
        }

        Ok(Self {
            options: JobOptions {
                scan_type: request.scan_type,
                ports,
                timeout,
                rate_limit,
            },
            request,
            backend,
            targets,
            total_targets,
        })
    }

    pub fn total_targets(&self) -> usize {
        self.total_targets
    }
}

/// Returned by job creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreated {
    pub scan_id: Uuid,
    pub status: JobStatus,
    /// Seconds.
    pub estimated_duration: u64,
}

/// Point-in-time view of a job. Taken under one read lock, so fields agree.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub scan_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub scan_type: ScanType,
    pub scanner: String,
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_target: Option<String>,
    pub results_count: usize,
    pub total_targets: usize,
    #[serde(with = "rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub completed_with_errors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
}

type Callback = Box<dyn FnOnce(JobStatus) + Send>;

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    progress: u8,
    current_target: Option<Target>,
    results: Vec<ScanResult>,
    started_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    error: Option<String>,
    completed_with_errors: bool,
}

pub struct ScanJob {
    id: Uuid,
    request: ScanRequest,
    backend: ArcBackend,
    options: JobOptions,
    targets: TargetSet,
    total_targets: usize,
    schedule_id: Option<Uuid>,
    created_at: OffsetDateTime,
    estimated_duration: u64,
    cancel: CancellationToken,
    state: RwLock<JobState>,
    callbacks: Mutex<Vec<Callback>>,
    status_tx: watch::Sender<JobStatus>,
}

impl fmt::Debug for ScanJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanJob")
            .field("id", &self.id)
            .field("scanner", &self.backend.name())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ScanJob {
    pub fn new(plan: JobPlan, schedule_id: Option<Uuid>) -> Self {
        let estimated_duration =
            plan.options.scan_type.estimated_secs_per_target() * plan.total_targets as u64;
        let (status_tx, _) = watch::channel(JobStatus::Queued);
        Self {
            id: Uuid::new_v4(),
            request: plan.request,
            backend: plan.backend,
            options: plan.options,
            targets: plan.targets,
            total_targets: plan.total_targets,
            schedule_id,
            created_at: OffsetDateTime::now_utc(),
            estimated_duration,
            cancel: CancellationToken::new(),
            state: RwLock::new(JobState {
                status: JobStatus::Queued,
                progress: 0,
                current_target: None,
                results: Vec::new(),
                started_at: None,
                completed_at: None,
                error: None,
                completed_with_errors: false,
            }),
            callbacks: Mutex::new(Vec::new()),
            status_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> &ArcBackend {
        &self.backend
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn targets(&self) -> &TargetSet {
        &self.targets
    }

    pub fn total_targets(&self) -> usize {
        self.total_targets
    }

    pub fn schedule_id(&self) -> Option<Uuid> {
        self.schedule_id
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn created(&self) -> JobCreated {
        JobCreated {
            scan_id: self.id,
            status: JobStatus::Queued,
            estimated_duration: self.estimated_duration,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, JobState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> JobStatus {
        self.read().status
    }

    pub fn progress(&self) -> u8 {
        self.read().progress
    }

    pub fn completed_at(&self) -> Option<OffsetDateTime> {
        self.read().completed_at
    }

    /// Queued → Running. False if the job left `Queued` in the meantime.
    pub fn start(&self) -> bool {
        let mut state = self.write();
        if state.status != JobStatus::Queued {
            return false;
        }
        state.status = JobStatus::Running;
        state.started_at = Some(OffsetDateTime::now_utc());
        drop(state);
        self.status_tx.send_replace(JobStatus::Running);
        true
    }

    /// Queued or Running → Cancelled, tripping the job's token.
    pub fn cancel(&self) -> Result<JobStatus, ScanError> {
        {
            let mut state = self.write();
            if state.status.is_terminal() {
                return Err(ScanError::AlreadyTerminal {
                    status: state.status.to_string(),
                });
            }
            state.status = JobStatus::Cancelled;
            state.completed_at = Some(OffsetDateTime::now_utc());
            state.current_target = None;
        }
        self.cancel.cancel();
        self.after_terminal(JobStatus::Cancelled);
        Ok(JobStatus::Cancelled)
    }

    /// Running → `status` (Completed or Failed). False if a cancel won the race.
    pub fn finish(&self, status: JobStatus, error: Option<String>, completed_with_errors: bool) -> bool {
        debug_assert!(matches!(status, JobStatus::Completed | JobStatus::Failed));
        {
            let mut state = self.write();
            if state.status != JobStatus::Running {
                return false;
            }
            state.status = status;
            state.completed_at = Some(OffsetDateTime::now_utc());
            state.error = error;
            state.completed_with_errors = completed_with_errors;
            state.current_target = None;
        }
        self.after_terminal(status);
        true
    }

    /// Callbacks run before waiters wake, so a waiter sees their effects.
    fn after_terminal(&self, status: JobStatus) {
        let callbacks = std::mem::take(
            &mut *self.callbacks.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for callback in callbacks {
            callback(status);
        }
        self.status_tx.send_replace(status);
    }

    /// Run `callback` once the job is terminal; immediately if it already is.
    pub fn on_complete(&self, callback: impl FnOnce(JobStatus) + Send + 'static) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|p| p.into_inner());
        let status = self.status();
        if status.is_terminal() {
            drop(callbacks);
            callback(status);
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    pub fn set_current_target(&self, target: &Target) {
        let mut state = self.write();
        if state.status == JobStatus::Running {
            state.current_target = Some(target.clone());
        }
    }

    /// Append a target's final result and advance progress. Only a running
    /// job accepts results; returns whether this one was kept.
    pub fn record(&self, result: ScanResult) -> bool {
        let mut state = self.write();
        if state.status != JobStatus::Running {
            return false;
        }
        state.results.push(result);
        let done = state.results.len();
        state.progress = ((done * 100) / self.total_targets.max(1)).min(100) as u8;
        true
    }

    /// Results in insertion order.
    pub fn results(&self, limit: usize, offset: usize) -> Vec<ScanResult> {
        self.read()
            .results
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn view(&self) -> JobStatusView {
        let state = self.read();
        let estimated_completion = match (state.status, state.started_at) {
            (JobStatus::Running, Some(started)) if state.progress > 0 => {
                let elapsed = OffsetDateTime::now_utc() - started;
                started.checked_add(elapsed * (100.0 / f64::from(state.progress)))
            }
            _ => None,
        };
        JobStatusView {
            scan_id: self.id,
            status: state.status,
            progress: state.progress,
            scan_type: self.options.scan_type,
            scanner: self.backend.name().to_string(),
            targets: self.request.targets.clone(),
            current_target: state.current_target.as_ref().map(ToString::to_string),
            results_count: state.results.len(),
            total_targets: self.total_targets,
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            estimated_completion,
            error: state.error.clone(),
            completed_with_errors: state.completed_with_errors,
            schedule_id: self.schedule_id,
        }
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait_terminal(&self) -> JobStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::types::TargetOutcome;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry() -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(MockBackend::new("mock")));
        registry
    }

    fn job(targets: &[&str]) -> ScanJob {
        let request = ScanRequest::new(targets.iter().copied()).scanner("mock");
        let plan = JobPlan::validate(request, &registry(), &EngineConfig::default()).unwrap();
        ScanJob::new(plan, None)
    }

    fn result(last: u8) -> ScanResult {
        ScanResult::failed(
            Target::Ip(IpAddr::from([10, 0, 0, last])),
            TargetOutcome::Failed,
            "refused",
            1,
            Duration::ZERO,
        )
    }

    #[test]
    fn validation_rejects_before_queueing() {
        let engine = EngineConfig::default();
        let registry = registry();
        let unknown = ScanRequest::new(["10.0.0.1"]).scanner("zmap");
        assert!(matches!(
            JobPlan::validate(unknown, &registry, &engine),
            Err(ScanError::Configuration(_))
        ));
        let bad = ScanRequest::new(["10.0.0.300"]).scanner("mock");
        assert!(matches!(
            JobPlan::validate(bad, &registry, &engine),
            Err(ScanError::InvalidTarget { .. })
        ));
        let excluded = ScanRequest::new(["10.0.0.1"]).scanner("mock").exclude(["10.0.0.0/24"]);
        assert!(matches!(
            JobPlan::validate(excluded, &registry, &engine),
            Err(ScanError::InvalidTarget { .. })
        ));
        let zero_rate = ScanRequest::new(["10.0.0.1"]).scanner("mock").rate_limit(0);
        assert!(JobPlan::validate(zero_rate, &registry, &engine).is_err());
    }

    #[test]
    fn oversize_job_is_a_configuration_error() {
        let engine = EngineConfig {
            max_targets_per_job: 100,
            ..EngineConfig::default()
        };
        let request = ScanRequest::new(["10.0.0.0/16"]).scanner("mock");
        assert!(matches!(
            JobPlan::validate(request, &registry(), &engine),
            Err(ScanError::Configuration(ref m)) if m.contains("100")
        ));
    }

    #[test]
    fn estimated_duration_scales_with_targets() {
        let job = job(&["10.0.0.1", "10.0.0.2"]);
        assert_eq!(job.created().estimated_duration, 60);
        assert_eq!(job.options().timeout, Duration::from_secs(300));
        assert_eq!(job.options().rate_limit, 100);
    }

    #[test]
    fn transitions_only_move_forward() {
        let job = job(&["10.0.0.1"]);
        assert!(job.start());
        assert!(!job.start());
        assert!(job.finish(JobStatus::Completed, None, false));
        assert!(!job.finish(JobStatus::Failed, None, false));
        assert!(matches!(
            job.cancel(),
            Err(ScanError::AlreadyTerminal { ref status }) if status == "completed"
        ));
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn cancelled_queued_job_never_starts() {
        let job = job(&["10.0.0.1"]);
        assert_eq!(job.cancel().unwrap(), JobStatus::Cancelled);
        assert!(job.cancel_token().is_cancelled());
        assert!(!job.start());
        assert!(job.view().started_at.is_none());
    }

    #[test]
    fn results_only_recorded_while_running() {
        let job = job(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert!(!job.record(result(1)));
        job.start();
        assert!(job.record(result(1)));
        assert_eq!(job.progress(), 33);
        assert!(job.record(result(2)));
        assert!(job.record(result(3)));
        assert_eq!(job.progress(), 100);
        job.cancel().unwrap();
        assert!(!job.record(result(4)));
        let page = job.results(1, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].target.to_string(), "10.0.0.2");
    }

    #[test]
    fn completion_callbacks_fire_once() {
        let job = job(&["10.0.0.1"]);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        job.on_complete(move |status| {
            assert_eq!(status, JobStatus::Cancelled);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        job.start();
        job.cancel().unwrap();
        assert!(!job.finish(JobStatus::Completed, None, false));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let late = fired.clone();
        job.on_complete(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_terminal_resolves_on_finish() {
        let job = Arc::new(job(&["10.0.0.1"]));
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_terminal().await })
        };
        job.start();
        job.finish(JobStatus::Failed, Some("all 1 targets failed".into()), false);
        assert_eq!(waiter.await.unwrap(), JobStatus::Failed);
    }

    #[test]
    fn status_filter_parses() {
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
