//! Job queue and the worker loop that drives jobs through their backends.
//!
//! Workers take turns at the head of a single FIFO queue: the worker holding
//! the admission lock pops the oldest job and waits for a governor slot
//! before letting the next worker look at the queue. A job therefore never
//! overtakes one created before it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{probe_with_retry, ProbeAttempt, ProbeRequest};
use crate::error::ProbeError;
use crate::governor::{Governor, TokenBucket};
use crate::job::{JobStatus, ScanJob};
use crate::sink::{ResultEvent, ResultSink};
use crate::targets::Target;
use crate::types::{ScanResult, TargetOutcome};

/// Queued jobs in creation order.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<Arc<ScanJob>>,
    /// Popped jobs still waiting for a governor slot.
    admitting: usize,
}

impl QueueState {
    fn waiting(&self) -> usize {
        self.jobs.len() + self.admitting
    }
}

/// Counts a popped job as waiting until it holds a scan slot or is dropped.
#[derive(Debug)]
pub(crate) struct Admission {
    queue: Arc<JobQueue>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        state.admitting = state.admitting.saturating_sub(1);
    }
}

impl JobQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn push(&self, job: Arc<ScanJob>) {
        self.push_when(job, |_| true);
    }

    /// Push only if `admit` accepts the number of jobs still waiting for a slot.
    /// The decision and the push happen under one lock.
    pub fn push_when(&self, job: Arc<ScanJob>, admit: impl FnOnce(usize) -> bool) -> bool {
        let mut state = self.lock();
        if !admit(state.waiting()) {
            return false;
        }
        state.jobs.push_back(job);
        drop(state);
        self.available.notify_one();
        true
    }

    pub async fn pop(self: &Arc<Self>) -> (Arc<ScanJob>, Admission) {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(job) = state.jobs.pop_front() {
                    state.admitting += 1;
                    return (job, Admission { queue: self.clone() });
                }
            }
            notified.await;
        }
    }

    /// Jobs waiting for a scan slot, including ones a worker has popped.
    pub fn len(&self) -> usize {
        self.lock().waiting()
    }
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    pub queue: Arc<JobQueue>,
    pub governor: Governor,
    pub sink: Arc<dyn ResultSink>,
    pub per_job_concurrency: usize,
    pub shutdown: CancellationToken,
    admission: tokio::sync::Mutex<()>,
}

enum ProbeTask {
    Probed { attempt: ProbeAttempt, elapsed: Duration },
    /// Never reached the backend: the job was cancelled or timed out first.
    Abandoned,
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    permanent: usize,
    timed_out: usize,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<JobQueue>,
        governor: Governor,
        sink: Arc<dyn ResultSink>,
        per_job_concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            governor,
            sink,
            per_job_concurrency: per_job_concurrency.max(1),
            shutdown,
            admission: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!(worker, "dispatcher worker started");
        loop {
            let (job, slot) = {
                let _turn = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    turn = self.admission.lock() => turn,
                };
                let (job, _admission) = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    popped = self.queue.pop() => popped,
                };
                if job.status() != JobStatus::Queued {
                    debug!(scan_id = %job.id(), status = %job.status(), "skipping job that left the queue");
                    continue;
                }
                let slot = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    slot = self.governor.acquire(job.cancel_token()) => slot,
                };
                match slot {
                    Ok(slot) => (job, slot),
                    Err(_) => {
                        debug!(scan_id = %job.id(), "job cancelled while waiting for a scan slot");
                        continue;
                    }
                }
            };

            if job.start() {
                self.run_job(&job).await;
            }
            drop(slot);
        }
        debug!(worker, "dispatcher worker stopped");
    }

    async fn run_job(&self, job: &Arc<ScanJob>) {
        let options = job.options();
        let deadline = Instant::now() + options.timeout;
        let sub_limit = self
            .per_job_concurrency
            .min(self.governor.free_probe_slots())
            .max(1);
        info!(
            scan_id = %job.id(),
            scanner = job.backend().name(),
            targets = job.total_targets(),
            concurrency = sub_limit,
            "scan started"
        );

        let slots = Arc::new(Semaphore::new(sub_limit));
        let limiter = Arc::new(TokenBucket::new(options.rate_limit));
        let probe_cancel = job.cancel_token().child_token();
        let request = Arc::new(ProbeRequest {
            scan_type: options.scan_type,
            ports: options.ports.clone(),
            timeout: job.backend().default_timeout(),
        });

        let mut pending = job.targets().iter();
        let mut exhausted = false;
        let mut timed_out = false;
        let mut in_flight: HashMap<Id, Target> = HashMap::new();
        let mut set = JoinSet::new();
        let mut tally = Tally::default();
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            if exhausted && set.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = &mut expiry, if !timed_out => {
                    timed_out = true;
                    probe_cancel.cancel();
                    warn!(scan_id = %job.id(), timeout_secs = options.timeout.as_secs(), "scan timed out");
                }
                Some(joined) = set.join_next_with_id(), if !set.is_empty() => {
                    let (target, task) = match joined {
                        Ok((id, task)) => (in_flight.remove(&id), task),
                        Err(err) => {
                            let target = in_flight.remove(&err.id());
                            warn!(scan_id = %job.id(), error = %err, "probe task failed");
                            (target, ProbeTask::Probed {
                                attempt: ProbeAttempt {
                                    result: Err(ProbeError::Permanent("probe task failed".into())),
                                    attempts: 1,
                                },
                                elapsed: Duration::ZERO,
                            })
                        }
                    };
                    let Some(target) = target else { continue };
                    if !timed_out && Instant::now() >= deadline && is_timeout(&task) {
                        // Simultaneous per-target and job timeouts count as the job's.
                        timed_out = true;
                        probe_cancel.cancel();
                    }
                    if let Some(result) = self.to_result(target, task, timed_out, options.timeout) {
                        self.record(job, result, &mut tally);
                    }
                }
                permit = slots.clone().acquire_owned(), if !exhausted => {
                    let Ok(permit) = permit else {
                        exhausted = true;
                        continue;
                    };
                    if probe_cancel.is_cancelled() {
                        exhausted = true;
                        continue;
                    }
                    match pending.next() {
                        Some(target) => {
                            let handle = set.spawn(self.probe_task(
                                job.clone(),
                                target.clone(),
                                request.clone(),
                                limiter.clone(),
                                probe_cancel.clone(),
                                permit,
                            ));
                            in_flight.insert(handle.id(), target);
                        }
                        None => exhausted = true,
                    }
                }
            }
        }

        if timed_out {
            for target in pending {
                let result = ScanResult::failed(
                    target,
                    TargetOutcome::TimedOut,
                    job_timeout_message(options.timeout),
                    0,
                    Duration::ZERO,
                );
                if !self.record(job, result, &mut tally) {
                    break;
                }
            }
        }

        self.finalize(job, &tally, timed_out);
    }

    fn probe_task(
        &self,
        job: Arc<ScanJob>,
        target: Target,
        request: Arc<ProbeRequest>,
        limiter: Arc<TokenBucket>,
        cancel: CancellationToken,
        slot: OwnedSemaphorePermit,
    ) -> impl std::future::Future<Output = ProbeTask> + Send + 'static {
        let governor = self.governor.clone();
        async move {
            let _slot = slot;
            if cancel.is_cancelled() {
                return ProbeTask::Abandoned;
            }
            let Ok(_probe) = governor.acquire_probe(&cancel).await else {
                return ProbeTask::Abandoned;
            };
            if limiter.wait_turn(&cancel).await.is_err() {
                return ProbeTask::Abandoned;
            }
            job.set_current_target(&target);
            let began = Instant::now();
            let attempt = probe_with_retry(job.backend().as_ref(), &target, &request, &cancel).await;
            ProbeTask::Probed {
                attempt,
                elapsed: began.elapsed(),
            }
        }
    }

    /// Map a finished task to the result to record, if any. Work abandoned
    /// because the job was cancelled is not recorded.
    fn to_result(
        &self,
        target: Target,
        task: ProbeTask,
        timed_out: bool,
        job_timeout: Duration,
    ) -> Option<ScanResult> {
        let (attempt, elapsed) = match task {
            ProbeTask::Probed { attempt, elapsed } => (attempt, elapsed),
            ProbeTask::Abandoned if timed_out => {
                return Some(ScanResult::failed(
                    target,
                    TargetOutcome::TimedOut,
                    job_timeout_message(job_timeout),
                    0,
                    Duration::ZERO,
                ))
            }
            ProbeTask::Abandoned => return None,
        };
        let attempts = attempt.attempts;
        Some(match attempt.result {
            Ok(report) => ScanResult::succeeded(target, report, attempts, elapsed),
            Err(ProbeError::Cancelled) if timed_out => ScanResult::failed(
                target,
                TargetOutcome::TimedOut,
                job_timeout_message(job_timeout),
                attempts,
                elapsed,
            ),
            Err(ProbeError::Cancelled) => return None,
            Err(err @ ProbeError::Timeout(_)) => {
                let message = if timed_out {
                    job_timeout_message(job_timeout)
                } else {
                    err.to_string()
                };
                ScanResult::failed(target, TargetOutcome::TimedOut, message, attempts, elapsed)
            }
            Err(err) => {
                ScanResult::failed(target, TargetOutcome::Failed, err.to_string(), attempts, elapsed)
            }
        })
    }

    /// Append to the job and, only if that succeeded, emit to the sink.
    fn record(&self, job: &ScanJob, result: ScanResult, tally: &mut Tally) -> bool {
        let outcome = result.outcome;
        let event = ResultEvent {
            scan_id: job.id(),
            schedule_id: job.schedule_id(),
            scanner: job.backend().name().to_string(),
            result: result.clone(),
        };
        if !job.record(result) {
            return false;
        }
        match outcome {
            TargetOutcome::Succeeded => tally.succeeded += 1,
            TargetOutcome::TimedOut => tally.timed_out += 1,
            TargetOutcome::Failed => tally.permanent += 1,
        }
        self.sink.emit(event);
        true
    }

    fn finalize(&self, job: &ScanJob, tally: &Tally, timed_out: bool) {
        let total = job.total_targets();
        let failed = tally.permanent + tally.timed_out;
        let prefix = if timed_out {
            format!("{}; ", job_timeout_message(job.options().timeout))
        } else {
            String::new()
        };
        let (status, error, with_errors) = if tally.succeeded == 0 {
            let summary = format!(
                "{prefix}all {total} targets failed ({} permanent, {} timed out)",
                tally.permanent, tally.timed_out
            );
            (JobStatus::Failed, Some(summary), false)
        } else if failed > 0 {
            let summary = format!("{prefix}{failed} of {total} targets failed");
            (JobStatus::Completed, Some(summary), true)
        } else {
            (JobStatus::Completed, None, false)
        };

        if job.finish(status, error.clone(), with_errors) {
            info!(
                scan_id = %job.id(),
                status = %status,
                succeeded = tally.succeeded,
                failed,
                error = error.as_deref().unwrap_or(""),
                "scan finished"
            );
        } else {
            info!(scan_id = %job.id(), status = %job.status(), "scan stopped before completion");
        }
    }
}

fn is_timeout(task: &ProbeTask) -> bool {
    matches!(
        task,
        ProbeTask::Probed {
            attempt: ProbeAttempt {
                result: Err(ProbeError::Timeout(_)),
                ..
            },
            ..
        }
    )
}

fn job_timeout_message(timeout: Duration) -> String {
    format!("job timed out after {}s", timeout.as_secs())
}
