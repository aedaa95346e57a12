//! Where per-target results go once a job has recorded them.
//!
//! The dispatcher calls [`ResultSink::emit`] exactly once for every result it
//! appends to a job, after the append succeeded.

use std::fmt::Debug;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::types::ScanResult;

/// One normalized per-target event.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEvent {
    pub scan_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
    pub scanner: String,
    pub result: ScanResult,
}

pub trait ResultSink: Send + Sync + Debug {
    /// Must not block; slow consumers buffer on their side.
    fn emit(&self, event: ResultEvent);
}

/// Logs each result as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn emit(&self, event: ResultEvent) {
        let r = &event.result;
        let ports = r
            .open_ports
            .iter()
            .map(|p| p.port.to_string())
            .collect::<Vec<_>>()
            .join(",");
        info!(
            scan_id = %event.scan_id,
            scanner = %event.scanner,
            target = %r.target,
            outcome = r.outcome.as_str(),
            reachable = r.reachable,
            open_ports = %ports,
            attempts = r.attempts,
            error = r.error.as_deref().unwrap_or(""),
            "scan result"
        );
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ResultEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResultEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResultSink for ChannelSink {
    fn emit(&self, event: ResultEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn emit(&self, _event: ResultEvent) {}
}
