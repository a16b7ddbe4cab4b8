//! Monitor service - the operations exposed to a presentation layer

use std::sync::{Arc, RwLock};
use std::time::Duration;

use netwarden_analysis::SecurityAnalyzer;
use netwarden_common::Config;
use netwarden_core::{
    AnalysisResult, BlockError, CaptureError, Device, DiscoveryError, PacketInfo, PortResult,
    ScanError, SecurityFinding,
};
use netwarden_network::{
    CaptureConfig, CaptureState, CaptureStats, DataLinkReceiver, DeviceDiscoverer,
    DiscoveryConfig, EventBus, PacketCapture, PortScanConfig, PortScanner, Subscription,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::blocker::{BlockOutcome, IpBlocker};
use crate::session::{MonitorSession, SessionConfig, SessionView, SharedPorts};

struct Sniffer {
    capture: PacketCapture,
    session: MonitorSession,
}

/// Entry point for every monitoring operation
pub struct MonitorService {
    config: Config,
    discoverer: DeviceDiscoverer,
    scanner: PortScanner,
    analyzer: Arc<SecurityAnalyzer>,
    blocker: IpBlocker,
    bus: EventBus,
    last_ports: SharedPorts,
    sniffer: Mutex<Option<Sniffer>>,
    last_view: RwLock<Option<SessionView>>,
}

impl MonitorService {
    pub fn new(config: Config) -> Self {
        let analyzer = Arc::new(SecurityAnalyzer::from_config(&config));
        Self::with_analyzer(config, analyzer)
    }

    /// Service using a caller-built analyzer
    pub fn with_analyzer(config: Config, analyzer: Arc<SecurityAnalyzer>) -> Self {
        Self {
            discoverer: DeviceDiscoverer::with_config(DiscoveryConfig::from_settings(
                &config.discovery,
            )),
            scanner: PortScanner::with_config(PortScanConfig::from_settings(&config.scanner)),
            blocker: IpBlocker::from_settings(&config.blocker),
            bus: EventBus::new(config.capture.bus_capacity),
            analyzer,
            last_ports: SharedPorts::default(),
            sniffer: Mutex::new(None),
            last_view: RwLock::new(None),
            config,
        }
    }

    pub fn with_blocker(mut self, blocker: IpBlocker) -> Self {
        self.blocker = blocker;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Discovery & Scanning ─────────────────────────────────────────────────

    /// Enumerate live hosts on the local subnet
    pub async fn start_network_scan(&self) -> Result<Vec<Device>, DiscoveryError> {
        self.discoverer.discover().await
    }

    /// Sweep an explicit CIDR block instead of the local subnet
    pub async fn scan_network(&self, cidr: &str) -> Result<Vec<Device>, DiscoveryError> {
        self.discoverer.discover_cidr(cidr).await
    }

    /// Probe the configured ports on one host. The result also feeds the
    /// port rules of the live session's periodic analysis.
    pub async fn scan_device_ports(&self, address: &str) -> Result<Vec<PortResult>, ScanError> {
        let results = self.scanner.scan(address).await?;
        self.remember_ports(&results);
        Ok(results)
    }

    /// Like [`scan_device_ports`](Self::scan_device_ports) with an overall deadline
    pub async fn scan_device_ports_until(
        &self,
        address: &str,
        deadline: Duration,
    ) -> Result<Vec<PortResult>, ScanError> {
        let results = self.scanner.scan_until(address, deadline).await?;
        self.remember_ports(&results);
        Ok(results)
    }

    fn remember_ports(&self, results: &[PortResult]) {
        if let Ok(mut ports) = self.last_ports.write() {
            *ports = results.to_vec();
        }
    }

    // ── Analysis ─────────────────────────────────────────────────────────────

    /// One-shot analysis of caller-supplied ports and packets
    pub async fn get_security_analysis(
        &self,
        ports: &[PortResult],
        packets: &[PacketInfo],
    ) -> AnalysisResult {
        self.analyzer.analyze(ports, packets).await
    }

    // ── Live Capture ─────────────────────────────────────────────────────────

    /// Start capture on the configured interface together with periodic
    /// analysis. A no-op while already capturing.
    pub async fn start_live_sniffing(&self) -> Result<(), CaptureError> {
        self.start_sniffer(|capture| capture.start()).await
    }

    /// Start a session fed by an already opened receiver
    pub async fn start_sniffing_from(
        &self,
        source: &str,
        rx: Box<dyn DataLinkReceiver>,
    ) -> Result<(), CaptureError> {
        self.start_sniffer(move |capture| capture.start_with_receiver(source, rx))
            .await
    }

    async fn start_sniffer(
        &self,
        start: impl FnOnce(&PacketCapture) -> Result<(), CaptureError>,
    ) -> Result<(), CaptureError> {
        let mut sniffer = self.sniffer.lock().await;

        if let Some(existing) = sniffer.as_ref() {
            if existing.capture.state() == CaptureState::Capturing {
                info!("Live capture already running");
                return Ok(());
            }
        }

        // a previous session that ended on its own
        if let Some(previous) = sniffer.take() {
            if let Err(e) = Self::shutdown(previous).await {
                warn!("Previous capture ended with an error: {}", e);
            }
        }

        let capture = PacketCapture::new(
            CaptureConfig::from_settings(&self.config.capture),
            self.bus.clone(),
        );
        let packets = self.bus.subscribe();
        start(&capture)?;

        let session = MonitorSession::spawn(
            SessionConfig::from_settings(&self.config.analysis),
            Arc::clone(&self.analyzer),
            Arc::clone(&self.last_ports),
            packets,
            capture.subscribe_state(),
        );
        if let Ok(mut view) = self.last_view.write() {
            *view = Some(session.view());
        }

        *sniffer = Some(Sniffer { capture, session });
        Ok(())
    }

    /// Stop capture and periodic analysis. Returns `None` if nothing was
    /// running, and the capture's read error if the session failed.
    pub async fn stop_live_sniffing(&self) -> Result<Option<CaptureStats>, CaptureError> {
        let Some(sniffer) = self.sniffer.lock().await.take() else {
            return Ok(None);
        };
        Self::shutdown(sniffer).await.map(Some)
    }

    async fn shutdown(sniffer: Sniffer) -> Result<CaptureStats, CaptureError> {
        let stats = sniffer.capture.stop().await;
        sniffer.session.stop().await;
        stats
    }

    /// Live `new_packet` events. Subscriptions outlive individual capture
    /// sessions.
    pub fn subscribe_packets(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub async fn sniffer_state(&self) -> CaptureState {
        match self.sniffer.lock().await.as_ref() {
            Some(sniffer) => sniffer.capture.state(),
            None => CaptureState::Idle,
        }
    }

    /// Findings of the current or most recent session
    pub fn findings(&self) -> Vec<SecurityFinding> {
        self.view().map(|v| v.findings()).unwrap_or_default()
    }

    /// Rolling packet buffer of the current or most recent session
    pub fn recent_packets(&self) -> Vec<PacketInfo> {
        self.view().map(|v| v.recent_packets()).unwrap_or_default()
    }

    fn view(&self) -> Option<SessionView> {
        self.last_view.read().ok().and_then(|v| v.clone())
    }

    // ── Enforcement ──────────────────────────────────────────────────────────

    /// Block inbound traffic from `address`; idempotent
    pub async fn block_ip_address(&self, address: &str) -> Result<BlockOutcome, BlockError> {
        self.blocker.block(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocker::DryRunBackend;
    use netwarden_core::{FindingType, PortStatus, RiskLevel};
    use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::tcp::MutableTcpPacket;
    use std::collections::VecDeque;
    use std::io;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn service() -> MonitorService {
        let config = Config::builder()
            .geo_enabled(false)
            .analysis_interval_ms(20)
            .block_backend("dry-run")
            .build();
        MonitorService::new(config)
    }

    fn http_frame(payload: &[u8]) -> Vec<u8> {
        let ip_len = 20 + 20 + payload.len();
        let mut buf = vec![0u8; 14 + ip_len];
        MutableEthernetPacket::new(&mut buf)
            .unwrap()
            .set_ethertype(EtherTypes::Ipv4);
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[14..]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(ip_len as u16);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip.set_source(Ipv4Addr::new(192, 168, 1, 10));
            ip.set_destination(Ipv4Addr::new(203, 0, 113, 9));
        }
        let mut tcp = MutableTcpPacket::new(&mut buf[34..]).unwrap();
        tcp.set_source(51000);
        tcp.set_destination(80);
        tcp.set_data_offset(5);
        tcp.set_payload(payload);
        buf
    }

    struct Replay {
        frames: VecDeque<Vec<u8>>,
        current: Vec<u8>,
    }

    impl Replay {
        fn new(frames: Vec<Vec<u8>>) -> Box<Self> {
            Box::new(Self {
                frames: frames.into(),
                current: Vec::new(),
            })
        }
    }

    impl DataLinkReceiver for Replay {
        fn next(&mut self) -> io::Result<&[u8]> {
            match self.frames.pop_front() {
                Some(frame) => {
                    self.current = frame;
                    Ok(&self.current)
                }
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Err(io::Error::new(io::ErrorKind::TimedOut, "Timed out"))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_live_sniffing_end_to_end() {
        let service = service();
        let mut events = service.subscribe_packets();

        let frames = vec![http_frame(b"POST /login HTTP/1.1\r\n\r\nuser=bob&pass=hunter2")];
        service
            .start_sniffing_from("replay0", Replay::new(frames))
            .await
            .unwrap();
        assert_eq!(service.sniffer_state().await, CaptureState::Capturing);

        // second start while running is a no-op
        service
            .start_sniffing_from("replay0", Replay::new(Vec::new()))
            .await
            .unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.dst_port, Some(80));

        tokio::time::timeout(Duration::from_secs(5), async {
            while service.findings().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let kinds: Vec<_> = service.findings().iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&Some(FindingType::HttpTraffic)));
        assert!(kinds.contains(&Some(FindingType::CredentialLeak)));

        let stats = service.stop_live_sniffing().await.unwrap().unwrap();
        assert_eq!(stats.packets_captured, 1);
        assert_eq!(service.sniffer_state().await, CaptureState::Idle);
        assert!(service.stop_live_sniffing().await.unwrap().is_none());

        // history stays readable after stop
        assert_eq!(service.recent_packets().len(), 1);
    }

    struct Unplugged;

    impl DataLinkReceiver for Unplugged {
        fn next(&mut self) -> io::Result<&[u8]> {
            Err(io::Error::new(io::ErrorKind::Other, "network is down"))
        }
    }

    #[tokio::test]
    async fn test_dead_capture_can_be_restarted() {
        let service = service();
        service
            .start_sniffing_from("down0", Box::new(Unplugged))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while service.sniffer_state().await == CaptureState::Capturing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            service.sniffer_state().await,
            CaptureState::Stopped {
                error: Some(String::from("network is down"))
            }
        );

        service
            .start_sniffing_from("replay0", Replay::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(service.sniffer_state().await, CaptureState::Capturing);
        assert!(service.stop_live_sniffing().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_then_analyze() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = Config::builder().geo_enabled(false).build();
        config.scanner.ports = Some(port.to_string());
        let service = MonitorService::new(config);

        let ports = service.scan_device_ports("127.0.0.1").await.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].status, PortStatus::Open);

        let result = service
            .get_security_analysis(&[PortResult::open(3389)], &[])
            .await;
        assert_eq!(result.findings[0].risk, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_block_via_service() {
        let backend = Arc::new(DryRunBackend::new());
        let service = service().with_blocker(IpBlocker::new(backend.clone()));

        let first = service.block_ip_address("198.51.100.4").await.unwrap();
        let second = service.block_ip_address("198.51.100.4").await.unwrap();
        assert!(!first.is_already_blocked());
        assert!(second.is_already_blocked());
        assert_eq!(backend.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let service = service();
        assert!(service.stop_live_sniffing().await.unwrap().is_none());
        assert!(service.findings().is_empty());
        assert_eq!(service.sniffer_state().await, CaptureState::Idle);
    }
}
