use std::collections::HashSet;
use std::net::IpAddr;

use anyhow::Result;
use etherparse::err::packet::SliceError;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use ipnetwork::IpNetwork;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::debug;

/// Ports below this are treated as the server side of intra-network traffic.
pub const SERVICE_PORT_LIMIT: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Other,
}

/// The 5-tuple of a captured frame. Only ever used as a dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: TransportProtocol,
}

/// Addresses and subnets bound to this host's interfaces, captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct LocalNetworks {
    addrs: Vec<IpAddr>,
    networks: Vec<IpNetwork>,
}

impl LocalNetworks {
    pub fn new(addrs: Vec<IpAddr>, networks: Vec<IpNetwork>) -> Self {
        Self { addrs, networks }
    }

    pub fn discover() -> Result<Self> {
        let interfaces = NetworkInterface::show()?;
        let up = up_interfaces();
        Ok(Self::from_interfaces(&interfaces, |iface| up.contains(&iface.name)))
    }

    /// Collects the addresses of every interface `is_up` accepts. Loopback addresses are skipped.
    pub fn from_interfaces(interfaces: &[NetworkInterface], is_up: impl Fn(&NetworkInterface) -> bool) -> Self {
        let mut local = Self::default();
        for iface in interfaces {
            if !is_up(iface) {
                debug!("Skipping interface '{}': down or loopback", iface.name);
                continue;
            }
            for addr in &iface.addr {
                let ip = addr.ip();
                if ip.is_loopback() {
                    continue;
                }
                local.addrs.push(ip);
                if let Some(network) = local_network(ip, addr.netmask()) {
                    debug!("Local network on '{}': {}", iface.name, network);
                    local.networks.push(network);
                }
            }
        }
        local
    }

    /// Exact address match or containment in one of the local subnets.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.addrs.contains(&ip) || self.networks.iter().any(|network| network.contains(ip))
    }

    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }
}

/// Names of the interfaces flagged up that are not loopback. `network-interface` does not report
/// flags, so they come from the datalink layer.
pub fn up_interfaces() -> HashSet<String> {
    pnet_datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .map(|iface| iface.name)
        .collect()
}

// Interfaces without a reported netmask get /24 (IPv4) or /64 (IPv6).
fn local_network(ip: IpAddr, netmask: Option<IpAddr>) -> Option<IpNetwork> {
    if let Some(network) = netmask.and_then(|mask| IpNetwork::with_netmask(ip, mask).ok()) {
        return Some(network);
    }
    let prefix = if ip.is_ipv4() { 24 } else { 64 };
    IpNetwork::new(ip, prefix).ok()
}

/// Decides whether a frame leaves or enters the local host.
///
/// Traffic between two local endpoints is attributed to the client side: it counts as upload
/// only when it targets a service port from an ephemeral one. Traffic where neither endpoint is
/// local is counted as upload.
pub fn classify(
    local: &LocalNetworks,
    src_addr: IpAddr,
    dst_addr: IpAddr,
    src_port: u16,
    dst_port: u16,
) -> Direction {
    match (local.contains(src_addr), local.contains(dst_addr)) {
        (true, false) => Direction::Upload,
        (false, true) => Direction::Download,
        (true, true) => {
            if dst_port < SERVICE_PORT_LIMIT && src_port >= SERVICE_PORT_LIMIT {
                Direction::Upload
            } else {
                Direction::Download
            }
        }
        (false, false) => Direction::Upload,
    }
}

/// Extracts the 5-tuple of an Ethernet frame.
///
/// `Ok(None)` means the frame parsed but carries no IP header. Frames without TCP or UDP keep
/// their addresses and report port 0 on both sides.
pub fn parse_flow(frame: &[u8]) -> Result<Option<FlowKey>, SliceError> {
    let packet = SlicedPacket::from_ethernet(frame)?;

    let (src_addr, dst_addr) = match &packet.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return Ok(None),
    };

    let (src_port, dst_port, protocol) = match &packet.transport {
        Some(TransportSlice::Tcp(tcp)) => (tcp.source_port(), tcp.destination_port(), TransportProtocol::Tcp),
        Some(TransportSlice::Udp(udp)) => (udp.source_port(), udp.destination_port(), TransportProtocol::Udp),
        _ => (0, 0, TransportProtocol::Other),
    };

    Ok(Some(FlowKey { src_addr, src_port, dst_addr, dst_port, protocol }))
}
