use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

use crate::targets::Target;

/// One open port on a probed host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

impl OpenPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: "tcp".to_string(),
            state: "open".to_string(),
            service: None,
            banner: None,
        }
    }
}

/// What a backend returns for a single successfully probed target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub reachable: bool,
    pub open_ports: Vec<OpenPort>,
    pub os_guess: Option<String>,
    pub duration: Duration,
}

/// Final outcome recorded for one target of a job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl TargetOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetOutcome::Succeeded => "succeeded",
            TargetOutcome::Failed => "failed",
            TargetOutcome::TimedOut => "timed_out",
        }
    }
}

/// Per-target result. Append-only: once recorded it is never modified.
#[derive(Serialize, Debug, Clone)]
pub struct ScanResult {
    pub target: Target,
    pub success: bool,
    pub outcome: TargetOutcome,
    pub reachable: bool,
    pub open_ports: Vec<OpenPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_guess: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    /// Seconds spent probing this target, retries included.
    pub scan_time: f64,
    #[serde(with = "rfc3339")]
    pub completed_at: OffsetDateTime,
}

impl ScanResult {
    pub fn succeeded(target: Target, report: ProbeReport, attempts: u32, elapsed: Duration) -> Self {
        Self {
            target,
            success: true,
            outcome: TargetOutcome::Succeeded,
            reachable: report.reachable,
            open_ports: report.open_ports,
            os_guess: report.os_guess,
            error: None,
            attempts,
            scan_time: elapsed.as_secs_f64(),
            completed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn failed(
        target: Target,
        outcome: TargetOutcome,
        error: impl Into<String>,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            target,
            success: false,
            outcome,
            reachable: false,
            open_ports: Vec::new(),
            os_guess: None,
            error: Some(error.into()),
            attempts,
            scan_time: elapsed.as_secs_f64(),
            completed_at: OffsetDateTime::now_utc(),
        }
    }
}

/// RFC 3339 serialization for `time` timestamps.
pub mod rfc3339 {
    use serde::Serializer;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        let formatted = ts.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        s.serialize_str(&formatted)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            ts: &Option<OffsetDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => super::serialize(ts, s),
                None => s.serialize_none(),
            }
        }
    }
}
