use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::ScanError;

/// Parse a port specification into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by commas or newlines. Supported entries:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
///
/// Order of first appearance is preserved.
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>, ScanError> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (start, end) = parse_entry(entry).map_err(|reason| {
                ScanError::configuration(format!("ports line {line_no}: {reason}"))
            })?;
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
        }
    }

    Ok(out)
}

/// Validate an explicit port list from an API request, dropping duplicates.
pub fn normalize_ports(ports: &[u32]) -> Result<Vec<u16>, ScanError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(ports.len());
    for &p in ports {
        if p == 0 || p > 65535 {
            return Err(ScanError::configuration(format!("port out of range: {p}")));
        }
        if seen.insert(p) {
            out.push(p as u16);
        }
    }
    Ok(out)
}

/// Load a ports list from a file path. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
        .with_context(|| format!("failed to parse ports file: {}", path.as_ref().display()))
}

/// A conservative default list of commonly used TCP ports.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 67, 68, 69, 80, 110, 123, 135, 137, 138, 139, 143, 161, 389, 443, 445,
        465, 500, 514, 587, 631, 993, 995, 1025, 1433, 1521, 1723, 1883, 2049, 2375, 2380, 3000,
        3128, 3260, 3306, 3389, 4369, 5000, 5040, 5432, 5672, 5900, 5985, 5986, 6379, 7001, 7002,
        8000, 8008, 8080, 8081, 8088, 8443, 8500, 8888, 9000, 9092, 9200, 9300, 11211, 27017,
    ];
    DEFAULT.to_vec()
}

/// Ports used to decide whether a host is up during a ping sweep.
pub fn sweep_ports() -> Vec<u16> {
    vec![80, 443, 22, 445, 3389]
}

fn parse_entry(entry: &str) -> Result<(u16, u16), String> {
    if let Some((a, b)) = entry.split_once('-') {
        let start = parse_port_str(a.trim())?;
        let end = parse_port_str(b.trim())?;
        if start > end {
            return Err(format!("invalid range {start}-{end} (start > end)"));
        }
        return Ok((start, end));
    }
    let p = parse_port_str(entry)?;
    Ok((p, p))
}

fn parse_port_str(s: &str) -> Result<u16, String> {
    let val: u32 = s
        .parse::<u32>()
        .map_err(|e| format!("invalid port value '{s}': {e}"))?;
    if val == 0 || val > 65535 {
        return Err(format!("port out of range: {val}"));
    }
    Ok(val as u16)
}
