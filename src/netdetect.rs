use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed and the result is sorted by network address, so the
/// `lan` target keyword expands in a stable order.
pub fn detect_local_networks() -> std::io::Result<Vec<Ipv4Net>> {
    let mut set = BTreeSet::<(u32, Ipv4Net)>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            let net = ipv4_to_default_cidr(v4.ip);
            debug!(interface = %iface.name, network = %net, "detected local network");
            set.insert((u32::from(net.network()), net));
        }
    }
    Ok(set.into_iter().map(|(_, net)| net).collect())
}

/// Convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    // Prefix 24 is always valid.
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24)
        .unwrap_or_else(|_| Ipv4Net::from(ip).trunc())
}
