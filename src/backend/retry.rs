//! Retry policy shared by every backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ProbeRequest, ScanBackend};
use crate::error::ProbeError;
use crate::targets::Target;
use crate::types::ProbeReport;

/// How many times a probe is attempted and how long to back off in between.
///
/// `max_attempts` counts the first attempt, so "one retry" is `max_attempts = 2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    pub factor: f64,
    #[serde(rename = "cap_ms", with = "millis")]
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fast_sweep()
    }
}

impl RetryPolicy {
    /// One retry after a short pause.
    pub fn fast_sweep() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            factor: 2.0,
            cap: Duration::from_secs(1),
        }
    }

    /// Up to three retries: 1s, 2s, 4s (capped at 8s).
    pub fn detailed_probe() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(8),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::fast_sweep()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.factor.max(1.0);
        let secs = self.base_delay.as_secs_f64() * factor.powi(retry as i32 - 1);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

/// Outcome of driving one target through a backend's retry policy.
#[derive(Debug, Clone)]
pub struct ProbeAttempt {
    pub result: Result<ProbeReport, ProbeError>,
    pub attempts: u32,
}

/// Probe `target`, retrying retryable failures per the backend's policy.
///
/// Each attempt is bounded by `request.timeout`. Exhausted transient failures
/// come back as `Permanent`; an exhausted timeout stays `Timeout`. Cancellation
/// is observed during attempts and during backoff sleeps.
pub async fn probe_with_retry(
    backend: &dyn ScanBackend,
    target: &Target,
    request: &ProbeRequest,
    cancel: &CancellationToken,
) -> ProbeAttempt {
    let policy = backend.retry_policy();
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return ProbeAttempt {
                result: Err(ProbeError::Cancelled),
                attempts,
            };
        }
        attempts += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            r = tokio::time::timeout(request.timeout, backend.probe_once(target, request, cancel)) => {
                r.unwrap_or(Err(ProbeError::Timeout(request.timeout)))
            }
        };

        let err = match result {
            Ok(report) => {
                return ProbeAttempt {
                    result: Ok(report),
                    attempts,
                }
            }
            Err(err) => err,
        };

        if err.is_retryable() && policy.should_retry(attempts) {
            let delay = policy.delay_for_retry(attempts);
            debug!(
                backend = backend.name(),
                target = %target,
                attempt = attempts,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying probe"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return ProbeAttempt { result: Err(ProbeError::Cancelled), attempts };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        let result = match err {
            ProbeError::Transient(msg) => Err(ProbeError::Permanent(format!(
                "{msg} (gave up after {attempts} attempts)"
            ))),
            other => Err(other),
        };
        return ProbeAttempt { result, attempts };
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
