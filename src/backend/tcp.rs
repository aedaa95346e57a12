//! TCP connect primitives shared by the network backends.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::targets::Target;
use crate::types::OpenPort;

/// Resolve a target to the address to connect to. Names resolve to their first address.
pub(crate) async fn resolve(target: &Target) -> Result<IpAddr, ProbeError> {
    match target {
        Target::Ip(ip) => Ok(*ip),
        Target::Host(name) => {
            let mut addrs = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => {
                        ProbeError::Transient(format!("resolving {name}: {e}"))
                    }
                    _ => ProbeError::Permanent(format!("cannot resolve {name}: {e}")),
                })?;
            addrs
                .next()
                .map(|a| a.ip())
                .ok_or_else(|| ProbeError::Permanent(format!("{name} has no addresses")))
        }
    }
}

/// Something that looks closer at a port once a connection succeeded.
#[async_trait]
pub(crate) trait PortInspector: Send + Sync + 'static {
    async fn inspect(&self, addr: SocketAddr, stream: TcpStream) -> OpenPort;
}

/// Result of connecting to every requested port of one host.
#[derive(Debug, Default)]
pub(crate) struct Sweep {
    pub open_ports: Vec<OpenPort>,
    /// An open port or an explicit refusal was seen.
    pub responded: bool,
    pub transient: Option<ProbeError>,
    pub permanent: Option<ProbeError>,
}

impl Sweep {
    /// Fold the per-port observations into a host-level verdict.
    ///
    /// Silence plus a hard error is a failure of the probe itself; silence
    /// alone is a host that is down or filtered.
    pub fn verdict(self) -> Result<Sweep, ProbeError> {
        if !self.responded {
            if let Some(err) = self.permanent {
                return Err(err);
            }
            if let Some(err) = self.transient {
                return Err(err);
            }
        }
        Ok(self)
    }
}

enum PortProbe {
    Open(OpenPort),
    Closed,
    Filtered,
    Failed(ProbeError),
}

/// Connect to each port with bounded concurrency, handing open sockets to `inspector`.
///
/// - Limits concurrent socket attempts using a `Semaphore`.
/// - Uses `tokio::time::timeout` to bound each connect.
/// - Stops launching new connects once `cancel` fires and drops in-flight ones.
pub(crate) async fn sweep_ports(
    ip: IpAddr,
    ports: &[u16],
    concurrency: usize,
    connect_timeout: Duration,
    cancel: &CancellationToken,
    inspector: Arc<dyn PortInspector>,
) -> Result<Sweep, ProbeError> {
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, 5_000)));
    let mut set = JoinSet::new();

    for &port in ports {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            p = sem.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let cancel = cancel.clone();
        let inspector = inspector.clone();
        set.spawn(async move {
            let _permit = permit;
            let addr = SocketAddr::new(ip, port);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => PortProbe::Filtered,
                p = probe_port(addr, connect_timeout, inspector) => p,
            }
        });
    }

    let mut sweep = Sweep::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(PortProbe::Open(port)) => {
                sweep.responded = true;
                sweep.open_ports.push(port);
            }
            Ok(PortProbe::Closed) => sweep.responded = true,
            Ok(PortProbe::Filtered) => {}
            Ok(PortProbe::Failed(err)) => {
                if err.is_retryable() {
                    sweep.transient.get_or_insert(err);
                } else {
                    sweep.permanent.get_or_insert(err);
                }
            }
            Err(join_err) => {
                sweep
                    .permanent
                    .get_or_insert(ProbeError::Permanent(format!("port task failed: {join_err}")));
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(ProbeError::Cancelled);
    }
    sweep.open_ports.sort_by_key(|p| p.port);
    Ok(sweep)
}

async fn probe_port(
    addr: SocketAddr,
    connect_timeout: Duration,
    inspector: Arc<dyn PortInspector>,
) -> PortProbe {
    match time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => PortProbe::Open(inspector.inspect(addr, stream).await),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => PortProbe::Closed,
        Ok(Err(e)) => PortProbe::Failed(ProbeError::from_io(&e)),
        // Silence on connect is the normal signature of a filtered port.
        Err(_) => PortProbe::Filtered,
    }
}

/// Try to read up to 256 bytes from the stream with a short timeout and convert to a lossy UTF-8 string.
pub(crate) async fn read_banner(stream: &mut TcpStream, wait: Duration) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match time::timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf).trim_end().to_string();
            Some(s.replace('\n', "\\n").replace('\r', "\\r"))
        }
        _ => None,
    }
}

/// Connect-only inspector used by breadth-first sweeps.
pub(crate) struct ConnectOnly;

#[async_trait]
impl PortInspector for ConnectOnly {
    async fn inspect(&self, addr: SocketAddr, _stream: TcpStream) -> OpenPort {
        OpenPort::tcp(addr.port())
    }
}
