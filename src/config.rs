//! Configuration: `scan-orchestrator.toml` parsing and runtime settings.
//!
//! Load order, highest priority first:
//! 1. CLI flags (applied by the binary)
//! 2. Environment variables (`SCAN_ORCH_ENGINE_WORKERS=8`)
//! 3. The config file
//! 4. `Default` implementations
//!
//! ```no_run
//! use scan_orchestrator::config::AppConfig;
//!
//! let config = AppConfig::load("scan-orchestrator.toml")?;
//! let config = AppConfig::parse("[engine]\nmax_concurrent_scans = 4")?;
//! # Ok::<(), scan_orchestrator::error::ConfigError>(())
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::RetryPolicy;
use crate::error::ConfigError;
use crate::schedule::ScheduleDraft;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    /// Schedules registered at startup.
    #[serde(default)]
    pub schedules: Vec<ScheduleDraft>,
}

impl AppConfig {
    /// Read the file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read and validate the file without environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Apply `SCAN_ORCH_{SECTION}_{FIELD}` overrides for scalar settings.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "SCAN_ORCH_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "SCAN_ORCH_GENERAL_LOG_FORMAT");

        override_parsed(&mut self.server.bind, "SCAN_ORCH_SERVER_BIND");

        let engine = &mut self.engine;
        override_parsed(&mut engine.max_concurrent_scans, "SCAN_ORCH_ENGINE_MAX_CONCURRENT_SCANS");
        override_parsed(&mut engine.max_concurrent_probes, "SCAN_ORCH_ENGINE_MAX_CONCURRENT_PROBES");
        override_parsed(&mut engine.per_job_concurrency, "SCAN_ORCH_ENGINE_PER_JOB_CONCURRENCY");
        override_parsed(&mut engine.workers, "SCAN_ORCH_ENGINE_WORKERS");
        override_parsed(&mut engine.default_rate_limit, "SCAN_ORCH_ENGINE_DEFAULT_RATE_LIMIT");
        override_parsed(&mut engine.default_timeout_secs, "SCAN_ORCH_ENGINE_DEFAULT_TIMEOUT_SECS");
        override_parsed(&mut engine.max_targets_per_job, "SCAN_ORCH_ENGINE_MAX_TARGETS_PER_JOB");
        override_parsed(&mut engine.max_finished_jobs, "SCAN_ORCH_ENGINE_MAX_FINISHED_JOBS");

        override_parsed(&mut self.scheduler.enabled, "SCAN_ORCH_SCHEDULER_ENABLED");
        override_parsed(
            &mut self.scheduler.tick_interval_secs,
            "SCAN_ORCH_SCHEDULER_TICK_INTERVAL_SECS",
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        let engine = &self.engine;
        for (field, value) in [
            ("engine.max_concurrent_scans", engine.max_concurrent_scans),
            ("engine.max_concurrent_probes", engine.max_concurrent_probes),
            ("engine.per_job_concurrency", engine.per_job_concurrency),
            ("engine.workers", engine.workers),
            ("engine.max_targets_per_job", engine.max_targets_per_job),
            ("engine.max_finished_jobs", engine.max_finished_jobs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        if engine.default_rate_limit == 0 {
            return Err(ConfigError::invalid(
                "engine.default_rate_limit",
                "must be at least 1",
            ));
        }
        if engine.default_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "engine.default_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "scheduler.tick_interval_secs",
                "must be greater than 0",
            ));
        }

        for (name, backend) in [("fast", &self.backends.fast), ("detailed", &self.backends.detailed)] {
            backend.validate(&format!("backends.{name}"))?;
        }

        for (i, draft) in self.schedules.iter().enumerate() {
            if draft.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("schedules[{i}].name"),
                    "must not be empty",
                ));
            }
            if draft.request.targets.is_empty() {
                return Err(ConfigError::invalid(
                    format!("schedules[{i}].targets"),
                    "must list at least one target",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    pub log_level: String,
    /// json or pretty.
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Admission control and dispatch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Jobs allowed in `Running` at once.
    pub max_concurrent_scans: usize,
    /// Target probes allowed in flight across all jobs.
    pub max_concurrent_probes: usize,
    /// Upper bound on concurrent probes inside a single job.
    pub per_job_concurrency: usize,
    /// Dispatcher tasks pulling from the queue.
    pub workers: usize,
    /// Probes per second when a job does not set `rate_limit`.
    pub default_rate_limit: u32,
    /// Job timeout when a request does not set one.
    pub default_timeout_secs: u64,
    pub max_targets_per_job: usize,
    /// Terminal jobs kept for status and result queries; older ones are evicted.
    pub max_finished_jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: 10,
            max_concurrent_probes: 256,
            per_job_concurrency: 16,
            workers: 4,
            default_rate_limit: 100,
            default_timeout_secs: 300,
            max_targets_per_job: 65_536,
            max_finished_jobs: 1000,
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default = "BackendSettings::fast_sweep")]
    pub fast: BackendSettings,
    #[serde(default = "BackendSettings::detailed_probe")]
    pub detailed: BackendSettings,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            fast: BackendSettings::fast_sweep(),
            detailed: BackendSettings::detailed_probe(),
        }
    }
}

/// Timing and retry knobs for one network backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Default per-target timeout.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Concurrent connects against one host.
    pub port_concurrency: usize,
    #[serde(default)]
    pub banner_wait_ms: u64,
    pub retry: RetryPolicy,
}

impl BackendSettings {
    pub fn fast_sweep() -> Self {
        Self {
            timeout_ms: 2_000,
            connect_timeout_ms: 400,
            port_concurrency: 256,
            banner_wait_ms: 0,
            retry: RetryPolicy::fast_sweep(),
        }
    }

    pub fn detailed_probe() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 1_500,
            port_concurrency: 32,
            banner_wait_ms: 300,
            retry: RetryPolicy::detailed_probe(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn banner_wait(&self) -> Duration {
        Duration::from_millis(self.banner_wait_ms)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(
                format!("{section}.timeout_ms"),
                "must be greater than 0",
            ));
        }
        if self.connect_timeout_ms == 0 || self.connect_timeout_ms > self.timeout_ms {
            return Err(ConfigError::invalid(
                format!("{section}.connect_timeout_ms"),
                "must be between 1 and timeout_ms",
            ));
        }
        if self.port_concurrency == 0 {
            return Err(ConfigError::invalid(
                format!("{section}.port_concurrency"),
                "must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                format!("{section}.retry.max_attempts"),
                "must be at least 1",
            ));
        }
        if !(self.retry.factor >= 1.0) {
            return Err(ConfigError::invalid(
                format!("{section}.retry.factor"),
                "must be >= 1.0",
            ));
        }
        Ok(())
    }
}

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse env override, ignoring"
            ),
        }
    }
}
