//! The schedule ticker and the schedule management API around it.
//!
//! A [`Scheduler`] owns its ticker task explicitly: nothing fires until
//! [`Scheduler::start`] is called, and [`Scheduler::stop`] waits for the task
//! to exit. Jobs go to the engine through the [`JobSubmitter`] seam.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ScanError;
use crate::job::{JobCreated, JobStatus, ScanJob, ScanRequest};
use crate::schedule::{Firing, Schedule, ScheduleDraft, ScheduleRegistry, ScheduleStats, ScheduleUpdate};

/// Where fired schedules send their jobs.
pub trait JobSubmitter: Send + Sync {
    /// Check that `request` would be accepted, without queueing it.
    fn validate(&self, request: &ScanRequest) -> Result<(), ScanError>;

    fn submit(&self, request: ScanRequest, schedule_id: Uuid) -> Result<Arc<ScanJob>, ScanError>;
}

struct Core {
    registry: Arc<ScheduleRegistry>,
    submitter: Arc<dyn JobSubmitter>,
}

impl Core {
    fn fire(&self, firing: Firing) -> Result<Arc<ScanJob>, ScanError> {
        let schedule_id = firing.schedule_id;
        match self.submitter.submit(firing.request, schedule_id) {
            Ok(job) => {
                info!(
                    schedule_id = %schedule_id,
                    schedule = %firing.name,
                    scan_id = %job.id(),
                    "schedule fired"
                );
                let registry: Weak<ScheduleRegistry> = Arc::downgrade(&self.registry);
                job.on_complete(move |status| {
                    if let Some(registry) = registry.upgrade() {
                        registry.record_outcome(schedule_id, status == JobStatus::Completed);
                    }
                });
                Ok(job)
            }
            Err(err) => {
                warn!(
                    schedule_id = %schedule_id,
                    schedule = %firing.name,
                    error = %err,
                    "schedule could not enqueue its scan"
                );
                self.registry.record_outcome(schedule_id, false);
                Err(err)
            }
        }
    }

    fn tick(&self, now: OffsetDateTime) -> Vec<Uuid> {
        let firings = self.registry.claim_due(now);
        if !firings.is_empty() {
            debug!(due = firings.len(), "schedule tick");
        }
        firings
            .into_iter()
            .filter_map(|firing| self.fire(firing).ok())
            .map(|job| job.id())
            .collect()
    }
}

pub struct Scheduler {
    core: Arc<Core>,
    tick_interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.tick_interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(submitter: Arc<dyn JobSubmitter>, tick_interval: Duration) -> Self {
        Self {
            core: Arc::new(Core {
                registry: Arc::new(ScheduleRegistry::new()),
                submitter,
            }),
            tick_interval: tick_interval.max(Duration::from_millis(10)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the ticker. Calling it while running does nothing.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        let core = self.core.clone();
        let period = self.tick_interval;
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_secs = period.as_secs(), "scheduler started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        core.tick(OffsetDateTime::now_utc());
                    }
                }
            }
            info!("scheduler stopped");
        });
        *task = Some((token, handle));
    }

    /// Stop the ticker and wait for it to exit. Jobs already queued keep running.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
    }

    /// Evaluate every schedule against `now`. Returns the ids of the jobs queued.
    pub fn tick_at(&self, now: OffsetDateTime) -> Vec<Uuid> {
        self.core.tick(now)
    }

    pub fn create(&self, draft: ScheduleDraft) -> Result<Schedule, ScanError> {
        if draft.name.trim().is_empty() {
            return Err(ScanError::configuration("schedule name must not be empty"));
        }
        self.core.submitter.validate(&draft.request)?;
        let schedule = self.core.registry.insert(draft, OffsetDateTime::now_utc())?;
        info!(
            schedule_id = %schedule.id,
            schedule = %schedule.name,
            frequency = %schedule.frequency,
            "schedule created"
        );
        Ok(schedule)
    }

    pub fn get(&self, id: Uuid) -> Result<Schedule, ScanError> {
        self.core.registry.get(id)
    }

    pub fn list(&self) -> Vec<Schedule> {
        self.core.registry.list()
    }

    pub fn update(&self, id: Uuid, update: ScheduleUpdate) -> Result<Schedule, ScanError> {
        let current = self.core.registry.get(id)?;
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(ScanError::configuration("schedule name must not be empty"));
            }
        }
        self.core
            .submitter
            .validate(&update.apply_to_request(&current.request))?;
        self.core
            .registry
            .update(id, update, OffsetDateTime::now_utc())
    }

    /// Remove a schedule. Jobs it already queued run on.
    pub fn delete(&self, id: Uuid) -> Result<Schedule, ScanError> {
        let removed = self.core.registry.remove(id)?;
        info!(schedule_id = %id, schedule = %removed.name, "schedule deleted");
        Ok(removed)
    }

    pub fn enable(&self, id: Uuid) -> Result<Schedule, ScanError> {
        self.core
            .registry
            .set_enabled(id, true, OffsetDateTime::now_utc())
    }

    /// Stop future firings. A job already queued from this schedule is not cancelled.
    pub fn disable(&self, id: Uuid) -> Result<Schedule, ScanError> {
        self.core
            .registry
            .set_enabled(id, false, OffsetDateTime::now_utc())
    }

    /// Queue a run now without moving `next_run`.
    pub fn run_now(&self, id: Uuid) -> Result<JobCreated, ScanError> {
        let firing = self.core.registry.claim_now(id, OffsetDateTime::now_utc())?;
        Ok(self.core.fire(firing)?.created())
    }

    pub fn stats(&self) -> ScheduleStats {
        self.core.registry.stats(self.is_running())
    }
}
