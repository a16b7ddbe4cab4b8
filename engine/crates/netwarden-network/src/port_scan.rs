//! Port scanning - TCP connect scan with a bounded probe pool
//!
//! Every probe has its own timeout, so one silent port never stalls the
//! rest. Results are always returned sorted by port number.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use netwarden_common::config::ScannerSettings;
use netwarden_core::{PortResult, ScanError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::probe::{tcp_probe, ProbeOutcome};
use crate::services::{parse_port_spec, service_name, DEFAULT_PORTS};

/// Port scanner configuration
#[derive(Debug, Clone)]
pub struct PortScanConfig {
    /// Ports to probe
    pub ports: Vec<u16>,
    /// Timeout per port
    pub timeout: Duration,
    /// Maximum concurrent probes per host
    pub concurrency: usize,
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORTS.to_vec(),
            timeout: Duration::from_millis(1000),
            concurrency: 32,
        }
    }
}

impl PortScanConfig {
    /// Build from the `[scanner]` section. An invalid port specification is
    /// reported and the default list used instead.
    pub fn from_settings(settings: &ScannerSettings) -> Self {
        let ports = match settings.ports.as_deref().map(parse_port_spec) {
            Some(Ok(ports)) => ports,
            Some(Err(e)) => {
                warn!("Ignoring scanner.ports: {}", e);
                DEFAULT_PORTS.to_vec()
            }
            None => DEFAULT_PORTS.to_vec(),
        };

        Self {
            ports,
            timeout: Duration::from_millis(settings.timeout_ms),
            concurrency: settings.concurrency.max(1),
        }
    }
}

/// Port scanner engine
#[derive(Debug, Clone, Default)]
pub struct PortScanner {
    config: PortScanConfig,
}

struct PortProbe {
    port: u16,
    outcome: ProbeOutcome,
}

impl PortScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PortScanConfig) -> Self {
        Self { config }
    }

    /// Replace the probed port list
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.config.ports = ports;
        self
    }

    pub fn config(&self) -> &PortScanConfig {
        &self.config
    }

    /// Scan every configured port on `address`.
    ///
    /// Zero open ports is a successful result. The scan fails with
    /// `ScanError::Unreachable` only when no probe reached the host and the
    /// network reported it unreachable.
    pub async fn scan(&self, address: &str) -> Result<Vec<PortResult>, ScanError> {
        let target = parse_target(address)?;
        self.run(target, None).await
    }

    /// Like [`scan`](Self::scan), but gives up after `deadline`. Probes that
    /// finished in time are returned inside `ScanError::DeadlineExceeded`.
    pub async fn scan_until(
        &self,
        address: &str,
        deadline: Duration,
    ) -> Result<Vec<PortResult>, ScanError> {
        let target = parse_target(address)?;
        self.run(target, Some(Instant::now() + deadline)).await
    }

    async fn run(
        &self,
        target: IpAddr,
        deadline: Option<Instant>,
    ) -> Result<Vec<PortResult>, ScanError> {
        info!(
            "Scanning {} ports on {} (concurrency {})",
            self.config.ports.len(),
            target,
            self.config.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut probes = JoinSet::new();

        for &port in &self.config.ports {
            let semaphore = Arc::clone(&semaphore);
            let limit = self.config.timeout;
            probes.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let outcome = tcp_probe(SocketAddr::new(target, port), limit).await;
                Some(PortProbe { port, outcome })
            });
        }

        let total = self.config.ports.len();
        let mut results = Vec::with_capacity(total);
        let mut answered = false;
        let mut unreachable: Option<String> = None;

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, probes.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        // probes not yet joined; failed tasks were already joined
                        let pending = probes.len();
                        probes.abort_all();
                        warn!(
                            "Scan of {} hit its deadline with {} probes pending",
                            target, pending
                        );
                        return Err(ScanError::DeadlineExceeded {
                            completed: finish(results),
                            pending,
                        });
                    }
                },
                None => probes.join_next().await,
            };

            let probe = match next {
                None => break,
                Some(Ok(Some(probe))) => probe,
                Some(Ok(None)) => continue,
                Some(Err(e)) => {
                    warn!("Port probe task failed: {}", e);
                    continue;
                }
            };

            answered |= probe.outcome.host_answered();
            let result = match probe.outcome {
                ProbeOutcome::Connected => {
                    debug!("Port {}:{} is open", target, probe.port);
                    PortResult::open(probe.port)
                }
                ProbeOutcome::Refused => PortResult::closed(probe.port),
                ProbeOutcome::TimedOut => PortResult::filtered(probe.port),
                ProbeOutcome::Unreachable(reason) | ProbeOutcome::LocalFailure(reason) => {
                    unreachable.get_or_insert(reason);
                    PortResult::filtered(probe.port)
                }
            };
            results.push(result);
        }

        if !answered {
            if let Some(reason) = unreachable {
                return Err(ScanError::Unreachable {
                    address: target.to_string(),
                    reason,
                });
            }
        }

        let results = finish(results);
        info!(
            "Scan of {} complete: {} open of {}",
            target,
            results.iter().filter(|r| r.is_open()).count(),
            results.len()
        );
        Ok(results)
    }
}

fn parse_target(address: &str) -> Result<IpAddr, ScanError> {
    address
        .trim()
        .parse()
        .map_err(|_| ScanError::InvalidAddress(address.to_string()))
}

/// Sort by port and attach service names
fn finish(mut results: Vec<PortResult>) -> Vec<PortResult> {
    results.sort_by_key(|r| r.port);
    results
        .into_iter()
        .map(|r| {
            let service = service_name(r.port).unwrap_or_default();
            r.with_service(service)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use netwarden_core::PortStatus;
    use tokio::net::TcpListener;

    /// Reserve `n` loopback ports that nothing listens on
    async fn closed_ports(n: usize) -> Vec<u16> {
        let mut ports = Vec::new();
        for _ in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ports.push(listener.local_addr().unwrap().port());
        }
        ports
    }

    #[tokio::test]
    async fn test_all_closed_host_is_not_an_error() {
        let mut ports = closed_ports(5).await;
        let scanner = PortScanner::new().with_ports(ports.clone());

        let results = scanner.scan("127.0.0.1").await.unwrap();

        ports.sort_unstable();
        assert_eq!(results.iter().map(|r| r.port).collect::<Vec<_>>(), ports);
        assert!(results.iter().all(|r| r.status == PortStatus::Closed));
    }

    #[tokio::test]
    async fn test_open_port_detected_and_sorted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let mut ports = closed_ports(3).await;
        ports.push(open);
        ports.reverse();

        let config = PortScanConfig {
            ports,
            concurrency: 2,
            ..Default::default()
        };
        let results = PortScanner::with_config(config)
            .scan("127.0.0.1")
            .await
            .unwrap();

        assert!(results.windows(2).all(|w| w[0].port < w[1].port));
        let found = results.iter().find(|r| r.port == open).unwrap();
        assert_eq!(found.status, PortStatus::Open);
        assert_eq!(results.iter().filter(|r| r.is_open()).count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let err = PortScanner::new().scan("not-an-ip").await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_zero_deadline_returns_partial_results() {
        let scanner = PortScanner::new().with_ports(closed_ports(4).await);
        let err = scanner
            .scan_until("127.0.0.1", Duration::ZERO)
            .await
            .unwrap_err();

        match err {
            ScanError::DeadlineExceeded { completed, pending } => {
                assert_eq!(completed.len() + pending, 4);
                assert!(completed.windows(2).all(|w| w[0].port < w[1].port));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_config_from_settings() {
        let settings = ScannerSettings {
            ports: Some("23,21-22".into()),
            timeout_ms: 250,
            concurrency: 0,
        };
        let config = PortScanConfig::from_settings(&settings);
        assert_eq!(config.ports, vec![21, 22, 23]);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.concurrency, 1);

        let bad = ScannerSettings {
            ports: Some("oops".into()),
            ..Default::default()
        };
        assert_eq!(PortScanConfig::from_settings(&bad).ports, DEFAULT_PORTS.to_vec());
    }

    #[test]
    fn test_service_names_attached() {
        let results = finish(vec![PortResult::open(23), PortResult::closed(40000)]);
        assert_eq!(results[0].service, "Telnet");
        assert_eq!(results[1].service, "");
    }
}
