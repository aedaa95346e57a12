//! Target expansion.
//!
//! Turns the target strings of a scan request into a lazy, deduplicated,
//! order-stable sequence of concrete [`Target`]s. Supported forms:
//!
//! * a single address: `10.0.0.1`, `fe80::1`
//! * a CIDR block: `192.168.1.0/24` (hosts only)
//! * an IPv4 range: `192.168.1.10-20` or `192.168.1.10-192.168.1.20`
//! * a hostname: `db01.internal`
//! * the keyword `lan`: every detected local IPv4 /24
//!
//! Nothing is materialised up front. Deduplication checks each candidate
//! against the specs that precede it, so memory stays proportional to the
//! number of specs rather than the number of hosts.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use serde::Serialize;

use crate::error::ScanError;
use crate::netdetect;

/// One concrete thing to probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Target {
    Ip(IpAddr),
    Host(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Ip(ip) => write!(f, "{ip}"),
            Target::Host(h) => f.write_str(h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetSpec {
    Addr(IpAddr),
    Net(IpNet),
    Range { start: Ipv4Addr, end: Ipv4Addr },
    Hostname(String),
}

impl TargetSpec {
    fn contains(&self, target: &Target) -> bool {
        match (self, target) {
            (TargetSpec::Addr(a), Target::Ip(ip)) => a == ip,
            (TargetSpec::Net(net), Target::Ip(ip)) => net.contains(ip) && hosts_contain(net, ip),
            (TargetSpec::Range { start, end }, Target::Ip(IpAddr::V4(v4))) => {
                (u32::from(*start)..=u32::from(*end)).contains(&u32::from(*v4))
            }
            (TargetSpec::Hostname(h), Target::Host(other)) => h.eq_ignore_ascii_case(other),
            _ => false,
        }
    }

    /// Whether every target `other` yields is also yielded by `self`.
    fn covers(&self, other: &TargetSpec) -> bool {
        match (self, other) {
            (TargetSpec::Hostname(a), TargetSpec::Hostname(b)) => a.eq_ignore_ascii_case(b),
            _ => match (self.bounds(), other.bounds()) {
                (Some((lo, hi)), Some((other_lo, other_hi))) => {
                    lo.is_ipv4() == other_lo.is_ipv4() && lo <= other_lo && other_hi <= hi
                }
                _ => false,
            },
        }
    }

    /// First and last address yielded. Every address spec yields one contiguous run.
    fn bounds(&self) -> Option<(IpAddr, IpAddr)> {
        match self {
            TargetSpec::Addr(ip) => Some((*ip, *ip)),
            TargetSpec::Net(net) => host_bounds(net),
            TargetSpec::Range { start, end } => Some((IpAddr::V4(*start), IpAddr::V4(*end))),
            TargetSpec::Hostname(_) => None,
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Target> + Send + '_> {
        match self {
            TargetSpec::Addr(ip) => Box::new(std::iter::once(Target::Ip(*ip))),
            TargetSpec::Net(net) => Box::new(net.hosts().map(Target::Ip)),
            TargetSpec::Range { start, end } => Box::new(
                (u32::from(*start)..=u32::from(*end))
                    .map(|n| Target::Ip(IpAddr::V4(Ipv4Addr::from(n)))),
            ),
            TargetSpec::Hostname(h) => Box::new(std::iter::once(Target::Host(h.clone()))),
        }
    }
}

/// First and last address `net.hosts()` yields. Only the two ends are inspected.
fn host_bounds(net: &IpNet) -> Option<(IpAddr, IpAddr)> {
    let mut hosts = net.hosts();
    let first = hosts.next()?;
    let last = hosts.next_back().unwrap_or(first);
    Some((first, last))
}

/// Whether `ip` is one of the addresses `net.hosts()` yields.
fn hosts_contain(net: &IpNet, ip: &IpAddr) -> bool {
    host_bounds(net).is_some_and(|(first, last)| first <= *ip && *ip <= last)
}

/// A validated, expandable set of targets with exclusions applied.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    specs: Vec<TargetSpec>,
    exclusions: Vec<TargetSpec>,
}

impl TargetSet {
    /// Parse target and exclusion strings. The first malformed entry rejects the whole set.
    pub fn parse<S: AsRef<str>>(targets: &[S], exclusions: &[S]) -> Result<Self, ScanError> {
        if targets.is_empty() {
            return Err(ScanError::invalid_target("", "no targets given"));
        }
        let mut specs = Vec::with_capacity(targets.len());
        for raw in targets {
            specs.extend(parse_spec(raw.as_ref())?);
        }
        let mut excl = Vec::with_capacity(exclusions.len());
        for raw in exclusions {
            excl.extend(parse_spec(raw.as_ref())?);
        }
        Ok(Self {
            specs,
            exclusions: excl,
        })
    }

    /// Iterate the concrete targets. Restartable: every call starts over in the same order.
    pub fn iter(&self) -> impl Iterator<Item = Target> + Send + '_ {
        self.live_specs()
            .flat_map(move |(i, spec)| spec.iter().filter(move |t| self.keeps(i, t)))
    }

    /// Count targets, stopping once `limit` is exceeded.
    ///
    /// Fails with `Configuration` once more than `max_examined` candidates
    /// have been looked at, so heavy exclusions over a huge range cannot
    /// stall the caller.
    pub fn count_bounded(&self, limit: usize, max_examined: usize) -> Result<usize, ScanError> {
        let mut examined = 0usize;
        let mut count = 0usize;
        for (i, spec) in self.live_specs() {
            for target in spec.iter() {
                examined += 1;
                if examined > max_examined {
                    return Err(ScanError::configuration(format!(
                        "target list needs more than {max_examined} candidates to expand; narrow the targets or exclusions"
                    )));
                }
                if self.keeps(i, &target) {
                    count += 1;
                    if count > limit {
                        return Ok(count);
                    }
                }
            }
        }
        Ok(count)
    }

    /// Specs not wholly covered by an exclusion or by an earlier spec.
    fn live_specs(&self) -> impl Iterator<Item = (usize, &TargetSpec)> + Send + '_ {
        self.specs.iter().enumerate().filter(move |&(i, spec)| {
            !self.specs[..i]
                .iter()
                .chain(&self.exclusions)
                .any(|e| e.covers(spec))
        })
    }

    /// Spec `i` yields `target` unless an earlier spec or an exclusion already holds it.
    fn keeps(&self, i: usize, target: &Target) -> bool {
        !self.specs[..i]
            .iter()
            .chain(&self.exclusions)
            .any(|e| e.contains(target))
    }
}

fn parse_spec(raw: &str) -> Result<Vec<TargetSpec>, ScanError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ScanError::invalid_target(raw, "empty target"));
    }

    if s.eq_ignore_ascii_case("lan") {
        let nets = netdetect::detect_local_networks().map_err(|e| {
            ScanError::invalid_target(s, format!("failed to detect local networks: {e}"))
        })?;
        if nets.is_empty() {
            return Err(ScanError::invalid_target(s, "no local IPv4 networks detected"));
        }
        return Ok(nets
            .into_iter()
            .map(|n| TargetSpec::Net(IpNet::V4(n)))
            .collect());
    }

    if s.contains('/') {
        let net: IpNet = s
            .parse()
            .map_err(|e| ScanError::invalid_target(s, format!("invalid CIDR: {e}")))?;
        return Ok(vec![TargetSpec::Net(net.trunc())]);
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(vec![TargetSpec::Addr(ip)]);
    }

    if let Some((a, b)) = s.split_once('-') {
        if let Ok(start) = a.trim().parse::<Ipv4Addr>() {
            let end = parse_range_end(start, b.trim())
                .ok_or_else(|| ScanError::invalid_target(s, "invalid range end"))?;
            if u32::from(start) > u32::from(end) {
                return Err(ScanError::invalid_target(s, "range start is after range end"));
            }
            return Ok(vec![TargetSpec::Range { start, end }]);
        }
    }

    validate_hostname(s)?;
    Ok(vec![TargetSpec::Hostname(s.to_ascii_lowercase())])
}

/// `20` means "same first three octets, last octet 20"; a full address is taken as-is.
fn parse_range_end(start: Ipv4Addr, end: &str) -> Option<Ipv4Addr> {
    if let Ok(full) = end.parse::<Ipv4Addr>() {
        return Some(full);
    }
    let last: u8 = end.parse().ok()?;
    let o = start.octets();
    Some(Ipv4Addr::new(o[0], o[1], o[2], last))
}

fn validate_hostname(s: &str) -> Result<(), ScanError> {
    if s.len() > 253 {
        return Err(ScanError::invalid_target(s, "hostname too long"));
    }
    // Digits and dots only was meant as an address.
    if s.chars().all(|c| c.is_ascii_digit() || c == '.') || s.contains(':') {
        return Err(ScanError::invalid_target(s, "invalid IP address"));
    }
    let host = s.strip_suffix('.').unwrap_or(s);
    for label in host.split('.') {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !ok {
            return Err(ScanError::invalid_target(s, "invalid hostname"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(set: &TargetSet) -> Vec<String> {
        set.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn cidr_yields_hosts_only() {
        let set = TargetSet::parse(&["192.168.1.0/30"], &[]).unwrap();
        assert_eq!(ips(&set), vec!["192.168.1.1", "192.168.1.2"]);
    }

    #[test]
    fn slash_32_and_31_keep_all_addresses() {
        let set = TargetSet::parse(&["10.0.0.7/32", "10.0.1.0/31"], &[]).unwrap();
        assert_eq!(ips(&set), vec!["10.0.0.7", "10.0.1.0", "10.0.1.1"]);
    }

    #[test]
    fn overlapping_specs_are_deduplicated_in_first_seen_order() {
        let set = TargetSet::parse(
            &["10.0.0.2", "10.0.0.0/29", "10.0.0.3-5", "10.0.0.2"],
            &[],
        )
        .unwrap();
        assert_eq!(
            ips(&set),
            vec!["10.0.0.2", "10.0.0.1", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"]
        );
    }

    #[test]
    fn network_address_of_a_cidr_is_not_treated_as_covered() {
        let set = TargetSet::parse(&["10.0.0.0/30", "10.0.0.0"], &[]).unwrap();
        assert_eq!(ips(&set), vec!["10.0.0.1", "10.0.0.2", "10.0.0.0"]);
    }

    #[test]
    fn exclusions_apply_before_yielding() {
        let set = TargetSet::parse(&["10.0.0.0/29"], &["10.0.0.2", "10.0.0.4-5"]).unwrap();
        assert_eq!(ips(&set), vec!["10.0.0.1", "10.0.0.3", "10.0.0.6"]);
    }

    #[test]
    fn expansion_is_restartable_and_stable() {
        let set = TargetSet::parse(&["172.16.0.0/28", "host-a.example", "HOST-A.example"], &[])
            .unwrap();
        let first = ips(&set);
        assert_eq!(first, ips(&set));
        assert_eq!(first.len(), 15);
        assert_eq!(first.last().map(String::as_str), Some("host-a.example"));
    }

    #[test]
    fn large_ranges_are_counted_lazily() {
        let set = TargetSet::parse(&["10.0.0.0/8"], &[]).unwrap();
        assert_eq!(set.count_bounded(1000, 4000).unwrap(), 1001);
    }

    #[test]
    fn wholly_excluded_network_is_skipped_without_walking_it() {
        let set = TargetSet::parse(&["fd00::/64"], &["fd00::/64"]).unwrap();
        assert_eq!(set.count_bounded(65_536, 262_144).unwrap(), 0);
        assert!(set.iter().next().is_none());

        let set = TargetSet::parse(&["10.0.0.0/8", "10.1.0.0/16", "10.2.0.7"], &["10.0.0.0/8"]).unwrap();
        assert_eq!(set.count_bounded(10, 40).unwrap(), 0);
    }

    #[test]
    fn spec_inside_an_earlier_one_is_skipped() {
        let set = TargetSet::parse(&["10.0.0.0/30", "10.0.0.1-2"], &[]).unwrap();
        assert_eq!(set.count_bounded(10, 2).unwrap(), 2);
    }

    #[test]
    fn partial_exclusion_of_a_huge_range_hits_the_examination_bound() {
        let set = TargetSet::parse(&["fd00::/64"], &["fd00::/65"]).unwrap();
        assert!(matches!(
            set.count_bounded(65_536, 262_144),
            Err(ScanError::Configuration(ref m)) if m.contains("262144")
        ));
    }

    #[test]
    fn covering_respects_address_family() {
        let v4 = TargetSpec::Net("0.0.0.0/0".parse().unwrap());
        let v6 = TargetSpec::Addr("::1".parse().unwrap());
        assert!(!v4.covers(&v6));
        let range = TargetSpec::Range {
            start: Ipv4Addr::new(10, 0, 0, 1),
            end: Ipv4Addr::new(10, 0, 0, 9),
        };
        assert!(range.covers(&TargetSpec::Addr("10.0.0.4".parse().unwrap())));
        assert!(!range.covers(&TargetSpec::Net("10.0.0.0/28".parse().unwrap())));
    }

    #[test]
    fn full_address_range_end() {
        let set = TargetSet::parse(&["192.168.1.254-192.168.2.1"], &[]).unwrap();
        assert_eq!(
            ips(&set),
            vec!["192.168.1.254", "192.168.1.255", "192.168.2.0", "192.168.2.1"]
        );
    }

    #[test]
    fn malformed_entries_name_the_offender() {
        for bad in ["10.0.0.300", "10.0.0.0/33", "10.0.0.9-3", "bad_host!", " ", "-lead.example"] {
            match TargetSet::parse(&["10.0.0.1", bad], &[]) {
                Err(ScanError::InvalidTarget { target, .. }) => {
                    assert_eq!(target.trim(), bad.trim())
                }
                other => panic!("expected InvalidTarget for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let empty: [&str; 0] = [];
        assert!(TargetSet::parse(&empty, &empty).is_err());
    }
}
