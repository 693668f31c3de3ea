use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use tracing::debug;

use crate::error::{ProbeError, Result};

use super::job::ClientAddresses;

/// a.root-servers.net, used only to pick a route; nothing is sent.
pub const ROOT_PROBE_V4: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 41, 0, 4)), 53);
pub const ROOT_PROBE_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x503, 0xba3e, 0, 0, 0, 0x2, 0x30)),
    53,
);

/// Local address the kernel would use to reach `target`, if any.
///
/// Connecting a UDP socket only consults the routing table.
pub fn source_address_for(target: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let local = socket.local_addr().ok()?.ip();
    if local.is_unspecified() {
        return None;
    }
    Some(local)
}

/// Resolves usable source addresses for both families and fails when
/// neither exists.
pub fn detect_client_addresses(
    probe_v4: SocketAddr,
    probe_v6: SocketAddr,
) -> Result<ClientAddresses> {
    let ipv4 = match source_address_for(probe_v4) {
        Some(IpAddr::V4(addr)) => Some(addr),
        _ => None,
    };
    let ipv6 = match source_address_for(probe_v6) {
        Some(IpAddr::V6(addr)) => Some(addr),
        _ => None,
    };
    let clients = ClientAddresses { ipv4, ipv6 };
    debug!(target: "dnsprobe::network", clients = %clients, "client addresses detected");

    if clients.is_empty() {
        return Err(ProbeError::NetworkUnavailable(
            "no network interfaces available for analysis".into(),
        ));
    }
    Ok(clients)
}
