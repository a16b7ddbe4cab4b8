//! Host discovery on the local subnet
//!
//! Hosts are found with TCP connect probes: a completed handshake and a
//! refused connection both prove the host is up. Hosts that answer none of
//! the probe ports (or drop them silently) are missed; this is a known
//! limitation of unprivileged discovery.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use netwarden_common::config::DiscoverySettings;
use netwarden_core::{Device, DiscoveryError};
use tracing::{debug, info, trace, warn};

use crate::interface::select_interface;
use crate::probe::{tcp_probe, ProbeOutcome};

/// Host discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Interface to sweep; auto-detected when unset
    pub interface: Option<String>,
    /// Ports to probe on every host
    pub probe_ports: Vec<u16>,
    /// Timeout per probe
    pub probe_timeout: Duration,
    /// Maximum concurrent host probes
    pub concurrency: usize,
    /// Overall sweep deadline
    pub deadline: Duration,
    /// Subnets wider than this prefix are narrowed around the local address
    pub min_prefix_len: u8,
    pub include_local: bool,
    pub resolve_mac: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::from_settings(&DiscoverySettings::default())
    }
}

impl DiscoveryConfig {
    pub fn from_settings(settings: &DiscoverySettings) -> Self {
        Self {
            interface: settings.interface.clone(),
            probe_ports: settings.probe_ports.clone(),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            concurrency: settings.concurrency.max(1),
            deadline: Duration::from_secs(settings.deadline_secs),
            min_prefix_len: settings.min_prefix_len,
            include_local: settings.include_local,
            resolve_mac: settings.resolve_mac,
        }
    }
}

/// Result of probing one host
#[derive(Debug)]
enum HostProbe {
    Up(IpAddr),
    Silent,
    Failed(String),
}

/// Host discovery engine
#[derive(Debug, Clone, Default)]
pub struct DeviceDiscoverer {
    config: DiscoveryConfig,
}

impl DeviceDiscoverer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Sweep the subnet of the active interface.
    ///
    /// An empty list means the sweep ran and nothing answered; failures are
    /// reported as errors.
    pub async fn discover(&self) -> Result<Vec<Device>, DiscoveryError> {
        let iface = select_interface(self.config.interface.as_deref())?;
        let prefix = iface.prefix_len.max(self.config.min_prefix_len);
        if prefix > iface.prefix_len {
            debug!(
                "Narrowing /{} subnet on {} to /{}",
                iface.prefix_len, iface.name, prefix
            );
        }

        let local_ip = IpAddr::V4(iface.ipv4);
        let targets: Vec<IpAddr> = subnet_hosts(iface.ipv4, prefix)
            .into_iter()
            .filter(|ip| *ip != local_ip)
            .collect();

        info!(
            "Discovering hosts on {}/{} via {} ({} addresses)",
            iface.ipv4,
            prefix,
            iface.name,
            targets.len()
        );

        let local = self.config.include_local.then(|| {
            let mut device = Device::new(local_ip).with_hostname(local_hostname()).local();
            if let Some(mac) = iface.mac {
                device = device.with_mac(mac.to_string());
            }
            device
        });

        self.sweep(targets, local).await
    }

    /// Sweep an explicit CIDR block instead of the interface subnet
    pub async fn discover_cidr(&self, cidr: &str) -> Result<Vec<Device>, DiscoveryError> {
        let targets = parse_cidr(cidr)?;
        info!("Discovering hosts in {} ({} addresses)", cidr, targets.len());
        self.sweep(targets, None).await
    }

    async fn sweep(
        &self,
        targets: Vec<IpAddr>,
        local: Option<Device>,
    ) -> Result<Vec<Device>, DiscoveryError> {
        let attempted = targets.len();
        let mut probes = stream::iter(targets)
            .map(|ip| self.probe_host(ip))
            .buffer_unordered(self.config.concurrency);

        let deadline = tokio::time::sleep(self.config.deadline);
        tokio::pin!(deadline);

        let mut found: Vec<IpAddr> = Vec::new();
        let mut failures = 0usize;
        let mut last_error = String::new();
        let mut timed_out = false;

        loop {
            tokio::select! {
                next = probes.next() => match next {
                    Some(HostProbe::Up(ip)) => found.push(ip),
                    Some(HostProbe::Silent) => {}
                    Some(HostProbe::Failed(e)) => {
                        failures += 1;
                        last_error = e;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }
        drop(probes);

        if attempted > 0 && failures == attempted {
            return Err(DiscoveryError::AllProbesFailed {
                attempted,
                last_error,
            });
        }

        let devices = self.build_devices(found, local).await;

        if timed_out {
            warn!(
                "Discovery deadline of {:?} exceeded; returning {} devices",
                self.config.deadline,
                devices.len()
            );
            return Err(DiscoveryError::DeadlineExceeded { found: devices });
        }

        info!("Discovery complete: {} devices", devices.len());
        Ok(devices)
    }

    async fn probe_host(&self, ip: IpAddr) -> HostProbe {
        let mut local_failure = None;

        for &port in &self.config.probe_ports {
            match tcp_probe(SocketAddr::new(ip, port), self.config.probe_timeout).await {
                ProbeOutcome::Connected | ProbeOutcome::Refused => {
                    debug!("Host {} is up (probe port {})", ip, port);
                    return HostProbe::Up(ip);
                }
                // an unreachable host is an answer: it is down
                ProbeOutcome::Unreachable(_) => return HostProbe::Silent,
                ProbeOutcome::TimedOut => {}
                ProbeOutcome::LocalFailure(e) => {
                    trace!("Probe {}:{} failed locally: {}", ip, port, e);
                    local_failure = Some(e);
                }
            }
        }

        match local_failure {
            Some(e) => HostProbe::Failed(e),
            None => HostProbe::Silent,
        }
    }

    /// Local device first, then responders ascending by address
    async fn build_devices(&self, mut found: Vec<IpAddr>, local: Option<Device>) -> Vec<Device> {
        found.sort();
        found.dedup();

        let macs = if self.config.resolve_mac {
            read_neighbour_cache().await
        } else {
            HashMap::new()
        };

        let mut devices: Vec<Device> = local.into_iter().collect();
        devices.extend(found.into_iter().map(|ip| {
            let device = Device::new(ip);
            match macs.get(&ip) {
                Some(mac) => device.with_mac(mac.clone()),
                None => device,
            }
        }));
        devices
    }
}

/// Hosts of the IPv4 network `ip/prefix`, without the network and broadcast
/// addresses for prefixes shorter than /31.
pub fn subnet_hosts(ip: Ipv4Addr, prefix: u8) -> Vec<IpAddr> {
    let prefix = prefix.min(32);
    let mask = if prefix == 0 {
        0
    } else {
        !((1u64 << (32 - prefix)) - 1) as u32
    };
    let network = u32::from(ip) & mask;
    let broadcast = network | !mask;

    let (start, end) = if prefix < 31 {
        (network + 1, broadcast - 1)
    } else {
        (network, broadcast)
    };

    (start..=end).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect()
}

/// Parse a CIDR block into its host addresses (minimum /16)
pub fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
    let (addr, prefix) = cidr
        .trim()
        .split_once('/')
        .ok_or_else(|| DiscoveryError::InvalidRange(format!("missing prefix in {}", cidr)))?;

    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| DiscoveryError::InvalidRange(format!("invalid IPv4 address {}", addr)))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| DiscoveryError::InvalidRange(format!("invalid prefix /{}", prefix)))?;

    if prefix < 16 {
        return Err(DiscoveryError::InvalidRange(
            "CIDR prefix too small (minimum /16)".to_string(),
        ));
    }

    Ok(subnet_hosts(ip, prefix))
}

/// Best-effort IP → MAC map from the kernel neighbour cache
async fn read_neighbour_cache() -> HashMap<IpAddr, String> {
    match tokio::fs::read_to_string("/proc/net/arp").await {
        Ok(table) => parse_arp_table(&table),
        Err(e) => {
            debug!("Neighbour cache unavailable: {}", e);
            HashMap::new()
        }
    }
}

/// Parse `/proc/net/arp`, skipping incomplete entries
pub fn parse_arp_table(table: &str) -> HashMap<IpAddr, String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let ip: IpAddr = cols.first()?.parse().ok()?;
            let mac = *cols.get(3)?;
            (mac != "00:00:00:00:00:00").then(|| (ip, mac.to_string()))
        })
        .collect()
}

fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}
