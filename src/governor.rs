//! Admission control: how many jobs run, how many probes are in flight, and
//! how fast a single job may send them.
//!
//! [`Governor`] carries two [`SlotPool`]s. The scan pool (`max_concurrent_scans`)
//! is held by a job for its whole `Running` life. The probe pool
//! (`max_concurrent_probes`) is taken per target. Both hand out RAII
//! [`GovernorPermit`]s. [`TokenBucket`] paces one job's probes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ScanError;

#[derive(Debug)]
struct PoolState {
    limit: usize,
    in_use: usize,
}

/// A resizable counting semaphore whose waits observe a cancellation token.
#[derive(Debug)]
pub struct SlotPool {
    state: Mutex<PoolState>,
    freed: Notify,
}

impl SlotPool {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                limit: limit.max(1),
                in_use: 0,
            }),
            freed: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self) -> bool {
        let mut state = self.lock();
        if state.in_use < state.limit {
            state.in_use += 1;
            true
        } else {
            false
        }
    }

    /// Wait for a free slot. Returns `Cancelled` as soon as `cancel` fires.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<GovernorPermit, ScanError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let notified = self.freed.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();
            if self.try_take() {
                return Ok(GovernorPermit { pool: self.clone() });
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Result<GovernorPermit, ScanError> {
        if self.try_take() {
            Ok(GovernorPermit { pool: self.clone() })
        } else {
            Err(ScanError::GovernorExhausted { limit: self.limit() })
        }
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.freed.notify_waiters();
    }

    /// Change the bound. Held permits are never revoked.
    pub fn set_limit(&self, limit: usize) {
        self.lock().limit = limit.max(1);
        self.freed.notify_waiters();
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn available(&self) -> usize {
        let state = self.lock();
        state.limit.saturating_sub(state.in_use)
    }
}

/// One held slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct GovernorPermit {
    pool: Arc<SlotPool>,
}

impl GovernorPermit {
    /// Release explicitly; same as dropping.
    pub fn release(self) {}
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GovernorSnapshot {
    pub max_concurrent_scans: usize,
    pub running_scans: usize,
    pub max_concurrent_probes: usize,
    pub probes_in_flight: usize,
}

/// Process-wide admission control shared by all dispatcher workers.
#[derive(Debug, Clone)]
pub struct Governor {
    scans: Arc<SlotPool>,
    probes: Arc<SlotPool>,
}

impl Governor {
    pub fn new(max_concurrent_scans: usize, max_concurrent_probes: usize) -> Self {
        Self {
            scans: SlotPool::new(max_concurrent_scans),
            probes: SlotPool::new(max_concurrent_probes),
        }
    }

    /// Block until a job slot is free.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GovernorPermit, ScanError> {
        self.scans.acquire(cancel).await
    }

    /// Non-blocking job admission.
    pub fn try_acquire(&self) -> Result<GovernorPermit, ScanError> {
        self.scans.try_acquire()
    }

    /// Block until a probe slot is free.
    pub async fn acquire_probe(
        &self,
        cancel: &CancellationToken,
    ) -> Result<GovernorPermit, ScanError> {
        self.probes.acquire(cancel).await
    }

    pub fn release(&self, permit: GovernorPermit) {
        permit.release();
    }

    pub fn set_max_concurrent_scans(&self, limit: usize) {
        self.scans.set_limit(limit);
    }

    /// Probe slots free right now.
    pub fn free_probe_slots(&self) -> usize {
        self.probes.available()
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            max_concurrent_scans: self.scans.limit(),
            running_scans: self.scans.in_use(),
            max_concurrent_probes: self.probes.limit(),
            probes_in_flight: self.probes.in_use(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket with capacity and refill both equal to `rate` per second.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(rate: u32) -> Self {
        let rate = f64::from(rate.max(1));
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last: Instant::now(),
            }),
        }
    }

    /// Take a token now, or report how long until one is available.
    fn take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
        }
    }

    /// Wait for this job's next turn to send a probe.
    pub async fn wait_turn(&self, cancel: &CancellationToken) -> Result<(), ScanError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            match self.take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_bounded_and_released_on_drop() {
        let governor = Governor::new(2, 8);
        let token = CancellationToken::new();
        let a = governor.acquire(&token).await.unwrap();
        let _b = governor.acquire(&token).await.unwrap();
        assert!(matches!(
            governor.try_acquire(),
            Err(ScanError::GovernorExhausted { limit: 2 })
        ));
        drop(a);
        assert_eq!(governor.snapshot().running_scans, 1);
        let _c = governor.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_woken_by_release() {
        let governor = Governor::new(1, 8);
        let token = CancellationToken::new();
        let held = governor.acquire(&token).await.unwrap();

        let waiter = {
            let governor = governor.clone();
            let token = token.clone();
            tokio::spawn(async move { governor.acquire(&token).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        governor.release(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_returns_immediately() {
        let governor = Governor::new(1, 8);
        let _held = governor.acquire(&CancellationToken::new()).await.unwrap();
        let token = CancellationToken::new();
        let waiter = {
            let governor = governor.clone();
            let token = token.clone();
            tokio::spawn(async move { governor.acquire(&token).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(ScanError::Cancelled));
        assert_eq!(governor.snapshot().running_scans, 1);
    }

    #[tokio::test]
    async fn shrinking_limit_keeps_held_permits() {
        let governor = Governor::new(3, 8);
        let token = CancellationToken::new();
        let a = governor.acquire(&token).await.unwrap();
        let b = governor.acquire(&token).await.unwrap();
        governor.set_max_concurrent_scans(1);
        assert_eq!(governor.snapshot().running_scans, 2);
        drop(a);
        assert!(governor.try_acquire().is_err());
        drop(b);
        let _c = governor.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_paces_after_burst() {
        let bucket = TokenBucket::new(10);
        let token = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..10 {
            bucket.wait_turn(&token).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(1));
        for _ in 0..5 {
            bucket.wait_turn(&token).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(490), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(520), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_wait_observes_cancel() {
        let bucket = TokenBucket::new(1);
        let token = CancellationToken::new();
        bucket.wait_turn(&token).await.unwrap();
        token.cancel();
        assert_eq!(bucket.wait_turn(&token).await, Err(ScanError::Cancelled));
    }
}
