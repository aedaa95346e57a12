//! Scanner backends.
//!
//! Every backend implements [`ScanBackend`], a fixed probing contract: one
//! target in, one [`ProbeReport`] or [`ProbeError`] out. Retrying, per-target
//! timeouts and cancellation around that call live in [`retry`], so a backend
//! only has to describe a single attempt and hand over its [`RetryPolicy`].
//!
//! Backends are looked up by name through [`BackendRegistry`] when a job is
//! created; an unknown name never reaches the dispatcher.
//!
//! ## Available backends
//!
//! - [`FastSweepBackend`] (`fast`, alias `masscan`): breadth first, connect only.
//! - [`DetailedProbeBackend`] (`detailed`, alias `nmap`): banners, service names, TLS subjects, OS hints.
//! - [`MockBackend`]: scripted outcomes for tests and demos.

pub mod detailed;
pub mod fast;
pub mod mock;
pub mod retry;
pub(crate) mod tcp;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::BackendsConfig;
use crate::error::{ProbeError, ScanError};
use crate::targets::Target;
use crate::types::ProbeReport;

pub use detailed::DetailedProbeBackend;
pub use fast::FastSweepBackend;
pub use mock::{MockBackend, MockBehavior};
pub use retry::{probe_with_retry, ProbeAttempt, RetryPolicy};

/// Kind of scan requested for a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ScanType {
    PingSweep,
    #[default]
    PortScan,
    ServiceDetection,
    OsDetection,
}

impl ScanType {
    /// Rough per-target cost used for `estimated_duration`.
    pub fn estimated_secs_per_target(self) -> u64 {
        match self {
            ScanType::PingSweep => 5,
            ScanType::PortScan => 30,
            ScanType::ServiceDetection => 60,
            ScanType::OsDetection => 90,
        }
    }
}

/// Parameters for probing a single target.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub scan_type: ScanType,
    pub ports: Vec<u16>,
    /// Bound on one attempt against one target.
    pub timeout: Duration,
}

#[async_trait]
pub trait ScanBackend: Send + Sync + Debug {
    /// Stable name used for lookups and logs.
    fn name(&self) -> &str;

    fn supports(&self, scan_type: ScanType) -> bool;

    /// Per-target timeout used when the caller gives none.
    fn default_timeout(&self) -> Duration;

    fn retry_policy(&self) -> &RetryPolicy;

    /// Perform one probe attempt. Implementations must return promptly once
    /// `cancel` fires and must not retry on their own.
    async fn probe_once(
        &self,
        target: &Target,
        request: &ProbeRequest,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport, ProbeError>;
}

pub type ArcBackend = Arc<dyn ScanBackend>;

/// Name-keyed backend lookup, consulted at job-creation time.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, ArcBackend>,
    aliases: BTreeMap<String, String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The two network backends, under their names and the historical tool aliases.
    pub fn with_defaults(config: &BackendsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FastSweepBackend::new(config.fast.clone())));
        registry.register(Arc::new(DetailedProbeBackend::new(config.detailed.clone())));
        registry.alias("masscan", "fast");
        registry.alias("nmap", "detailed");
        registry
    }

    pub fn register(&mut self, backend: ArcBackend) -> &mut Self {
        self.backends
            .insert(backend.name().to_ascii_lowercase(), backend);
        self
    }

    pub fn alias(&mut self, alias: &str, target: &str) -> &mut Self {
        self.aliases
            .insert(alias.to_ascii_lowercase(), target.to_ascii_lowercase());
        self
    }

    pub fn resolve(&self, name: &str) -> Result<ArcBackend, ScanError> {
        let key = name.trim().to_ascii_lowercase();
        let key = self.aliases.get(&key).cloned().unwrap_or(key);
        self.backends.get(&key).cloned().ok_or_else(|| {
            ScanError::configuration(format!(
                "unknown scanner '{name}', expected one of: {}",
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}
