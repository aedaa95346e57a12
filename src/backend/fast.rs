use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::tcp::{self, ConnectOnly};
use crate::backend::{ProbeRequest, RetryPolicy, ScanBackend, ScanType};
use crate::config::BackendSettings;
use crate::error::ProbeError;
use crate::ports;
use crate::targets::Target;
use crate::types::ProbeReport;

/// Breadth-first TCP connect sweep.
///
/// Connects only; no banners, no fingerprinting. Tolerates loss: a host that
/// answers on any port counts as reachable, silence counts as down, and only
/// a probe that saw nothing but errors is reported as failed.
#[derive(Debug)]
pub struct FastSweepBackend {
    settings: BackendSettings,
}

impl FastSweepBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl Default for FastSweepBackend {
    fn default() -> Self {
        Self::new(BackendSettings::fast_sweep())
    }
}

#[async_trait]
impl ScanBackend for FastSweepBackend {
    fn name(&self) -> &str {
        "fast"
    }

    fn supports(&self, scan_type: ScanType) -> bool {
        matches!(scan_type, ScanType::PingSweep | ScanType::PortScan)
    }

    fn default_timeout(&self) -> Duration {
        self.settings.timeout()
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    async fn probe_once(
        &self,
        target: &Target,
        request: &ProbeRequest,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport, ProbeError> {
        let started = Instant::now();
        let ip = tcp::resolve(target).await?;
        let port_list = match request.scan_type {
            ScanType::PingSweep => ports::sweep_ports(),
            _ if request.ports.is_empty() => ports::default_ports(),
            _ => request.ports.clone(),
        };

        let sweep = tcp::sweep_ports(
            ip,
            &port_list,
            self.settings.port_concurrency,
            self.settings.connect_timeout(),
            cancel,
            Arc::new(ConnectOnly),
        )
        .await?
        .verdict()?;

        let open_ports = if request.scan_type == ScanType::PingSweep {
            Vec::new()
        } else {
            sweep.open_ports
        };
        Ok(ProbeReport {
            reachable: sweep.responded,
            open_ports,
            os_guess: None,
            duration: started.elapsed(),
        })
    }
}
