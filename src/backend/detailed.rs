use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::backend::tcp::{self, PortInspector};
use crate::backend::{ProbeRequest, RetryPolicy, ScanBackend, ScanType};
use crate::config::BackendSettings;
use crate::error::ProbeError;
use crate::ports;
use crate::targets::Target;
use crate::types::{OpenPort, ProbeReport};

const TLS_PORTS: &[u16] = &[443, 465, 636, 853, 993, 995, 5986, 8443];

/// Depth-first probe: connect, grab banners, name services, read TLS
/// certificate subjects and guess the operating system.
#[derive(Debug)]
pub struct DetailedProbeBackend {
    settings: BackendSettings,
}

impl DetailedProbeBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl Default for DetailedProbeBackend {
    fn default() -> Self {
        Self::new(BackendSettings::detailed_probe())
    }
}

#[async_trait]
impl ScanBackend for DetailedProbeBackend {
    fn name(&self) -> &str {
        "detailed"
    }

    fn supports(&self, _scan_type: ScanType) -> bool {
        true
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
        let inspector: Arc<dyn PortInspector> = if request.scan_type == ScanType::PingSweep {
            Arc::new(tcp::ConnectOnly)
        } else {
            Arc::new(Fingerprint {
                sni: target.to_string(),
                banner_wait: self.settings.banner_wait(),
            })
        };

        let sweep = tcp::sweep_ports(
            ip,
            &port_list,
            self.settings.port_concurrency,
            self.settings.connect_timeout(),
            cancel,
            inspector,
        )
        .await?
        .verdict()?;

        let os_guess = match request.scan_type {
            ScanType::OsDetection | ScanType::ServiceDetection => guess_os(&sweep.open_ports),
            _ => None,
        };
        let open_ports = if request.scan_type == ScanType::PingSweep {
            Vec::new()
        } else {
            sweep.open_ports
        };
        Ok(ProbeReport {
            reachable: sweep.responded,
            open_ports,
            os_guess,
            duration: started.elapsed(),
        })
    }
}

struct Fingerprint {
    sni: String,
    banner_wait: Duration,
}

#[async_trait]
impl PortInspector for Fingerprint {
    async fn inspect(&self, addr: SocketAddr, mut stream: TcpStream) -> OpenPort {
        let port = addr.port();
        let mut open = OpenPort::tcp(port);

        if TLS_PORTS.contains(&port) {
            open.banner = tls_subject(stream, &self.sni, self.banner_wait * 4).await;
            open.service = well_known_service(port).map(str::to_string);
            return open;
        }

        open.banner = tcp::read_banner(&mut stream, self.banner_wait).await;
        open.service = open
            .banner
            .as_deref()
            .and_then(service_from_banner)
            .or_else(|| well_known_service(port).map(str::to_string));
        trace!(%addr, service = ?open.service, "fingerprinted port");
        open
    }
}

/// Complete a TLS handshake (certificate checks off) and describe the peer certificate subject.
async fn tls_subject(stream: TcpStream, sni: &str, wait: Duration) -> Option<String> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .ok()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let tls = time::timeout(wait, connector.connect(sni, stream))
        .await
        .ok()?
        .ok()?;
    let der = tls.get_ref().peer_certificate().ok()??.to_der().ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der).ok()?;
    Some(format!("tls subject: {}", cert.subject()))
}

fn well_known_service(port: u16) -> Option<&'static str> {
    Some(match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 | 465 | 587 => "smtp",
        53 => "domain",
        80 | 8000 | 8008 | 8080 | 8081 | 8088 => "http",
        110 | 995 => "pop3",
        135 => "msrpc",
        139 | 445 => "microsoft-ds",
        143 | 993 => "imap",
        389 | 636 => "ldap",
        443 | 8443 => "https",
        1433 => "ms-sql",
        1521 => "oracle",
        3306 => "mysql",
        3389 => "ms-wbt-server",
        5432 => "postgresql",
        5900 => "vnc",
        5985 | 5986 => "winrm",
        6379 => "redis",
        9200 => "elasticsearch",
        11211 => "memcached",
        27017 => "mongodb",
        _ => return None,
    })
}

fn service_from_banner(banner: &str) -> Option<String> {
    let upper = banner.to_ascii_uppercase();
    let service = if let Some(rest) = banner.strip_prefix("SSH-") {
        // "SSH-2.0-OpenSSH_9.6 Ubuntu" -> "ssh OpenSSH_9.6"
        let version = rest.split('-').nth(1).unwrap_or("").split_whitespace().next();
        return Some(match version {
            Some(v) if !v.is_empty() => format!("ssh {v}"),
            _ => "ssh".to_string(),
        });
    } else if upper.starts_with("HTTP/") {
        "http"
    } else if upper.starts_with("220") && upper.contains("FTP") {
        "ftp"
    } else if upper.starts_with("220") && (upper.contains("SMTP") || upper.contains("ESMTP")) {
        "smtp"
    } else if upper.starts_with("+OK") {
        "pop3"
    } else if upper.starts_with("* OK") {
        "imap"
    } else if upper.starts_with("RFB ") {
        "vnc"
    } else if upper.contains("MYSQL") || upper.contains("MARIADB") {
        "mysql"
    } else {
        return None;
    };
    Some(service.to_string())
}

fn guess_os(open_ports: &[OpenPort]) -> Option<String> {
    let banners = open_ports
        .iter()
        .filter_map(|p| p.banner.as_deref())
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    let has = |port: u16| open_ports.iter().any(|p| p.port == port);

    for (needle, os) in [
        ("ubuntu", "Linux (Ubuntu)"),
        ("debian", "Linux (Debian)"),
        ("centos", "Linux (CentOS)"),
        ("red hat", "Linux (Red Hat)"),
        ("freebsd", "FreeBSD"),
        ("microsoft", "Windows"),
        ("windows", "Windows"),
    ] {
        if banners.contains(needle) {
            return Some(os.to_string());
        }
    }
    if has(3389) || (has(135) && has(445)) {
        return Some("Windows".to_string());
    }
    if banners.contains("openssh") {
        return Some("Linux/Unix".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn banners_refine_service_names() {
        assert_eq!(
            service_from_banner("SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13").as_deref(),
            Some("ssh OpenSSH_9.6p1")
        );
        assert_eq!(service_from_banner("220 mail ESMTP Postfix").as_deref(), Some("smtp"));
        assert_eq!(service_from_banner("hello"), None);
    }

    #[test]
    fn os_guess_prefers_banner_evidence() {
        let mut ssh = OpenPort::tcp(22);
        ssh.banner = Some("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3".into());
        assert_eq!(guess_os(&[ssh]).as_deref(), Some("Linux (Ubuntu)"));

        let rdp = OpenPort::tcp(3389);
        assert_eq!(guess_os(&[rdp]).as_deref(), Some("Windows"));
        assert_eq!(guess_os(&[OpenPort::tcp(8080)]), None);
    }

    #[tokio::test]
    async fn service_detection_reads_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.6 Debian\r\n").await;
            }
        });

        let backend = DetailedProbeBackend::default();
        let report = backend
            .probe_once(
                &Target::Ip(IpAddr::from([127, 0, 0, 1])),
                &ProbeRequest {
                    scan_type: ScanType::ServiceDetection,
                    ports: vec![port],
                    timeout: Duration::from_secs(5),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.open_ports.len(), 1);
        let open = &report.open_ports[0];
        assert_eq!((open.protocol.as_str(), open.state.as_str()), ("tcp", "open"));
        assert_eq!(open.service.as_deref(), Some("ssh OpenSSH_9.6"));
        assert!(open.banner.as_deref().unwrap_or("").starts_with("SSH-2.0"));
        assert_eq!(report.os_guess.as_deref(), Some("Linux (Debian)"));
    }
}
