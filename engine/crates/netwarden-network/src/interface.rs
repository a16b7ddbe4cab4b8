//! Network interface detection and selection

use pnet::datalink::{self, NetworkInterface};
use pnet::util::MacAddr;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::{debug, warn};

use netwarden_core::{CaptureError, DiscoveryError};

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("interface '{0}' does not exist")]
    NotFound(String),

    #[error("interface '{0}' has no usable IPv4 address")]
    NoAddress(String),

    #[error("no active non-loopback interface with an IPv4 address")]
    NoCandidate,
}

impl From<InterfaceError> for DiscoveryError {
    fn from(e: InterfaceError) -> Self {
        DiscoveryError::NoInterface(e.to_string())
    }
}

impl From<InterfaceError> for CaptureError {
    fn from(e: InterfaceError) -> Self {
        CaptureError::InterfaceNotFound(e.to_string())
    }
}

/// The interface the monitor operates on
#[derive(Debug, Clone)]
pub struct LocalInterface {
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub prefix_len: u8,
    pub mac: Option<MacAddr>,
    pub pnet: NetworkInterface,
}

/// Pick the interface to monitor.
///
/// A named interface must exist and carry an IPv4 address. Otherwise the
/// best-scoring active physical adapter wins.
pub fn select_interface(preferred: Option<&str>) -> Result<LocalInterface, InterfaceError> {
    let interfaces = datalink::interfaces();

    if let Some(name) = preferred {
        let iface = interfaces
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| InterfaceError::NotFound(name.to_string()))?;
        return usable_ipv4(&iface)
            .map(|(ipv4, prefix_len)| LocalInterface {
                name: iface.name.clone(),
                ipv4,
                prefix_len,
                mac: iface.mac,
                pnet: iface.clone(),
            })
            .ok_or_else(|| InterfaceError::NoAddress(name.to_string()));
    }

    let mut candidates: Vec<LocalInterface> = interfaces
        .iter()
        .filter(|i| i.is_up() && !i.is_loopback())
        .filter(|i| !is_virtual_adapter_name(&i.name.to_lowercase()))
        .filter_map(|i| {
            usable_ipv4(i).map(|(ipv4, prefix_len)| LocalInterface {
                name: i.name.clone(),
                ipv4,
                prefix_len,
                mac: i.mac,
                pnet: i.clone(),
            })
        })
        .collect();

    candidates.sort_by_key(|c| std::cmp::Reverse(interface_score(&c.ipv4)));

    match candidates.into_iter().next() {
        Some(best) => {
            debug!(
                "Selected interface {} ({}/{})",
                best.name, best.ipv4, best.prefix_len
            );
            Ok(best)
        }
        None => {
            warn!("No usable interface among {} candidates", interfaces.len());
            Err(InterfaceError::NoCandidate)
        }
    }
}

fn usable_ipv4(iface: &NetworkInterface) -> Option<(Ipv4Addr, u8)> {
    iface.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_link_local() && net.prefix() > 0 => {
            Some((ip, net.prefix()))
        }
        _ => None,
    })
}

pub fn is_virtual_adapter_name(name_lower: &str) -> bool {
    ["docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "vethernet", "wsl", "hyper-v"]
        .iter()
        .any(|p| name_lower.contains(p))
}

/// Selection priority for an interface address. Home/office LANs win;
/// Windows mobile-hotspot subnets (192.168.137.x) lose to everything.
pub fn interface_score(ip: &Ipv4Addr) -> u32 {
    let octets = ip.octets();
    match octets {
        [192, 168, 137, _] => 10,
        [192, 168, _, _] => 100,
        [10, _, _, _] => 90,
        [172, 16..=31, _, _] => 50,
        _ => 70,
    }
}
