//! Mock backend for testing.
//!
//! Scripts probe outcomes per target so the dispatcher, retry policy and
//! scheduler can be exercised without touching the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::{ProbeRequest, RetryPolicy, ScanBackend, ScanType};
use crate::error::ProbeError;
use crate::targets::Target;
use crate::types::{OpenPort, ProbeReport};

/// What a single attempt against a target does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Host is up with these ports open.
    Open(Vec<u16>),
    /// Host answered but nothing is open.
    Down,
    Transient,
    Permanent(String),
    /// Never returns on its own; only a timeout or cancellation ends it.
    Hang,
}

/// A scripted backend.
///
/// Each target has a queue of behaviors consumed one per attempt; the last
/// entry repeats. Targets without a script use the default behavior.
///
/// ```rust
/// use scan_orchestrator::backend::{MockBackend, MockBehavior};
/// use std::time::Duration;
///
/// let backend = MockBackend::new("mock")
///     .with_default(MockBehavior::Open(vec![22]))
///     .with_script("10.0.0.9", vec![MockBehavior::Transient, MockBehavior::Open(vec![80])])
///     .with_latency(Duration::from_millis(50));
/// ```
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    default: MockBehavior,
    scripts: Mutex<HashMap<String, Vec<MockBehavior>>>,
    latency: Duration,
    timeout: Duration,
    retry: RetryPolicy,
    attempts: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: MockBehavior::Open(vec![80]),
            scripts: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::fast_sweep(),
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn with_script(self, target: &str, script: Vec<MockBehavior>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.to_string(), script);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attempts made against one target so far.
    pub fn attempts_for(&self, target: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of concurrent `probe_once` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn next_behavior(&self, key: &str) -> MockBehavior {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let n = attempts.entry(key.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let scripts = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match scripts.get(key) {
            Some(script) if !script.is_empty() => {
                let idx = (attempt as usize - 1).min(script.len() - 1);
                script[idx].clone()
            }
            _ => self.default.clone(),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScanBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _scan_type: ScanType) -> bool {
        true
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn probe_once(
        &self,
        target: &Target,
        _request: &ProbeRequest,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport, ProbeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let behavior = self.next_behavior(&target.to_string());
        let wait = async {
            if behavior == MockBehavior::Hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.latency).await;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            _ = wait => {}
        }

        match behavior {
            MockBehavior::Open(ports) => Ok(ProbeReport {
                reachable: true,
                open_ports: ports.into_iter().map(OpenPort::tcp).collect(),
                os_guess: None,
                duration: self.latency,
            }),
            MockBehavior::Down => Ok(ProbeReport {
                reachable: false,
                duration: self.latency,
                ..ProbeReport::default()
            }),
            MockBehavior::Transient => Err(ProbeError::Transient("connection reset".into())),
            MockBehavior::Permanent(msg) => Err(ProbeError::Permanent(msg)),
            MockBehavior::Hang => Err(ProbeError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::probe_with_retry;
    use std::net::IpAddr;

    fn request() -> ProbeRequest {
        ProbeRequest {
            scan_type: ScanType::PortScan,
            ports: vec![],
            timeout: Duration::from_secs(1),
        }
    }

    fn ip(last: u8) -> Target {
        Target::Ip(IpAddr::from([10, 0, 0, last]))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_is_retried_then_succeeds() {
        let backend = MockBackend::new("mock")
            .with_script("10.0.0.1", vec![MockBehavior::Transient, MockBehavior::Open(vec![22])]);
        let attempt =
            probe_with_retry(&backend, &ip(1), &request(), &CancellationToken::new()).await;
        assert_eq!(attempt.attempts, 2);
        assert_eq!(attempt.result.unwrap().open_ports, vec![OpenPort::tcp(22)]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_becomes_permanent() {
        let backend = MockBackend::new("mock")
            .with_default(MockBehavior::Transient)
            .with_retry(RetryPolicy::detailed_probe());
        let started = tokio::time::Instant::now();
        let attempt =
            probe_with_retry(&backend, &ip(2), &request(), &CancellationToken::new()).await;
        assert_eq!(attempt.attempts, 4);
        assert!(matches!(attempt.result, Err(ProbeError::Permanent(ref m)) if m.contains("4 attempts")));
        // Backoff: 1s + 2s + 4s.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_is_not_retried() {
        let backend = MockBackend::new("mock").with_default(MockBehavior::Permanent("denied".into()));
        let attempt =
            probe_with_retry(&backend, &ip(3), &request(), &CancellationToken::new()).await;
        assert_eq!(attempt.attempts, 1);
        assert_eq!(attempt.result.unwrap_err(), ProbeError::Permanent("denied".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_times_out_per_attempt() {
        let backend = MockBackend::new("mock")
            .with_default(MockBehavior::Hang)
            .with_retry(RetryPolicy::no_retry());
        let attempt =
            probe_with_retry(&backend, &ip(4), &request(), &CancellationToken::new()).await;
        assert_eq!(attempt.result.unwrap_err(), ProbeError::Timeout(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_in_flight_probe() {
        let backend = Arc::new(MockBackend::new("mock").with_default(MockBehavior::Hang));
        let cancel = CancellationToken::new();
        let task = {
            let backend = backend.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let req = ProbeRequest {
                    timeout: Duration::from_secs(3600),
                    ..request()
                };
                probe_with_retry(&*backend, &ip(5), &req, &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let attempt = task.await.unwrap();
        assert_eq!(attempt.result.unwrap_err(), ProbeError::Cancelled);
        assert_eq!(backend.attempts_for("10.0.0.5"), 1);
    }
}
