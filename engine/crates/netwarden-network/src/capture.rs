//! Live packet capture
//!
//! [`PacketCapture`] attaches to one interface through `pnet::datalink`,
//! decodes every frame into a [`PacketInfo`] and publishes it on the
//! [`EventBus`]. The read loop runs on a dedicated OS thread with a short
//! read timeout so [`PacketCapture::stop`] returns promptly.
//!
//! # Lifecycle
//!
//! `Idle -> Capturing -> Stopped`. A capture is single-use: once stopped it
//! cannot be restarted; create a new one. A read failure other than a
//! timeout is fatal: the state moves to `Stopped` carrying the error, and
//! the error is returned from `stop()`. There is no automatic restart.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use netwarden_common::config::CaptureSettings;
use netwarden_core::{CaptureError, PacketInfo, Protocol};
use pnet::datalink::{self, Channel::Ethernet, Config as PnetConfig, DataLinkReceiver};
use pnet::packet::arp::{ArpOperations, ArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::bus::EventBus;
use crate::interface::select_interface;

// ── Configuration ────────────────────────────────────────────────────────────

/// Configuration for a capture session
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Interface name; auto-detected when unset
    pub interface: Option<String>,
    pub promiscuous: bool,
    /// Maximum payload bytes kept in `PacketInfo::payload`
    pub payload_preview_len: usize,
    /// Channel read timeout; bounds the latency of `stop()`
    pub read_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::from_settings(&CaptureSettings::default())
    }
}

impl CaptureConfig {
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self {
            interface: settings.interface.clone(),
            promiscuous: settings.promiscuous,
            payload_preview_len: settings.payload_preview_len,
            read_timeout: Duration::from_millis(settings.read_timeout_ms.max(1)),
        }
    }
}

// ── State & Statistics ───────────────────────────────────────────────────────

/// Capture lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Capturing,
    /// `error` is set when the session ended on a fatal read failure
    Stopped { error: Option<String> },
}

/// Aggregate statistics of a capture session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub interface: Option<String>,
    pub packets_captured: u64,
    pub bytes_captured: u64,
    pub protocol_breakdown: BTreeMap<String, u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

const PROTOCOLS: [Protocol; 5] = [
    Protocol::Tcp,
    Protocol::Udp,
    Protocol::Icmp,
    Protocol::Icmpv6,
    Protocol::Other,
];

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    bytes: AtomicU64,
    by_protocol: [AtomicU64; 5],
}

impl Counters {
    fn record(&self, packet: &PacketInfo) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(packet.length as u64, Ordering::Relaxed);
        if let Some(idx) = PROTOCOLS.iter().position(|p| *p == packet.protocol) {
            self.by_protocol[idx].fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    thread: Option<JoinHandle<Result<(), CaptureError>>>,
    outcome: Option<Result<(), CaptureError>>,
    interface: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

// ── Packet Capture ───────────────────────────────────────────────────────────

/// A single-use live capture session
pub struct PacketCapture {
    config: CaptureConfig,
    bus: EventBus,
    state: Arc<watch::Sender<CaptureState>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    lifecycle: Mutex<Lifecycle>,
}

impl PacketCapture {
    pub fn new(config: CaptureConfig, bus: EventBus) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        Self {
            config,
            bus,
            state: Arc::new(state),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Open the configured interface and begin capturing.
    ///
    /// Calling `start` while already capturing is a no-op.
    pub fn start(&self) -> Result<(), CaptureError> {
        match self.state() {
            CaptureState::Capturing => return Ok(()),
            CaptureState::Stopped { .. } => return Err(CaptureError::SessionClosed),
            CaptureState::Idle => {}
        }

        let iface = select_interface(self.config.interface.as_deref())?;

        let mut pnet_config = PnetConfig::default();
        pnet_config.promiscuous = self.config.promiscuous;
        pnet_config.read_timeout = Some(self.config.read_timeout);

        let rx = match datalink::channel(&iface.pnet, pnet_config) {
            Ok(Ethernet(_tx, rx)) => rx,
            Ok(_) => {
                return Err(CaptureError::ChannelOpen(
                    "Unsupported channel type".into(),
                ))
            }
            Err(e) => return Err(CaptureError::ChannelOpen(e.to_string())),
        };

        self.start_with_receiver(iface.name, rx)
    }

    /// Begin capturing from an already opened receiver
    pub fn start_with_receiver(
        &self,
        source: impl Into<String>,
        rx: Box<dyn DataLinkReceiver>,
    ) -> Result<(), CaptureError> {
        let mut lifecycle = self.lock();
        match self.state() {
            CaptureState::Capturing => return Ok(()),
            CaptureState::Stopped { .. } => return Err(CaptureError::SessionClosed),
            CaptureState::Idle => {}
        }

        let source = source.into();
        let worker = CaptureLoop {
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            bus: self.bus.clone(),
            preview_len: self.config.payload_preview_len,
        };

        // Capturing must be visible before the worker can publish Stopped
        self.running.store(true, Ordering::SeqCst);
        self.state.send_replace(CaptureState::Capturing);
        let handle = std::thread::Builder::new()
            .name(String::from("netwarden-capture"))
            .spawn(move || worker.run(rx))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                self.state.send_replace(CaptureState::Idle);
                CaptureError::Thread(e.to_string())
            })?;

        info!("Packet capture started on '{}'", source);
        lifecycle.thread = Some(handle);
        lifecycle.interface = Some(source);
        lifecycle.started_at = Some(Utc::now());
        Ok(())
    }

    /// Stop capturing, release the interface and return the session stats.
    ///
    /// If the session ended on a read failure, that error is returned.
    pub async fn stop(&self) -> Result<CaptureStats, CaptureError> {
        let handle = {
            let mut lifecycle = self.lock();
            if self.state() == CaptureState::Idle {
                self.state.send_replace(CaptureState::Stopped { error: None });
                lifecycle.outcome = Some(Ok(()));
            }
            self.running.store(false, Ordering::SeqCst);
            lifecycle.thread.take()
        };

        if let Some(handle) = handle {
            let joined = tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| CaptureError::Thread(e.to_string()))?;
            let outcome = joined.unwrap_or_else(|_| {
                Err(CaptureError::Thread(String::from("capture thread panicked")))
            });

            let mut lifecycle = self.lock();
            lifecycle.ended_at = Some(Utc::now());
            lifecycle.outcome = Some(outcome);
            self.state.send_modify(|state| {
                if !matches!(state, CaptureState::Stopped { .. }) {
                    *state = CaptureState::Stopped { error: None };
                }
            });
        }

        let outcome = self.lock().outcome.clone().unwrap_or(Ok(()));
        let stats = self.stats();
        info!(
            "Packet capture stopped: {} packets, {} bytes",
            stats.packets_captured, stats.bytes_captured
        );
        outcome.map(|()| stats)
    }

    /// Current statistics (safe to call while capturing)
    pub fn stats(&self) -> CaptureStats {
        let lifecycle = self.lock();
        let protocol_breakdown = PROTOCOLS
            .iter()
            .zip(self.counters.by_protocol.iter())
            .map(|(p, n)| (p.as_str().to_string(), n.load(Ordering::Relaxed)))
            .filter(|(_, n)| *n > 0)
            .collect();

        CaptureStats {
            interface: lifecycle.interface.clone(),
            packets_captured: self.counters.packets.load(Ordering::Relaxed),
            bytes_captured: self.counters.bytes.load(Ordering::Relaxed),
            protocol_breakdown,
            started_at: lifecycle.started_at,
            ended_at: lifecycle.ended_at,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct CaptureLoop {
    running: Arc<AtomicBool>,
    state: Arc<watch::Sender<CaptureState>>,
    counters: Arc<Counters>,
    bus: EventBus,
    preview_len: usize,
}

impl CaptureLoop {
    fn run(self, mut rx: Box<dyn DataLinkReceiver>) -> Result<(), CaptureError> {
        while self.running.load(Ordering::Relaxed) {
            match rx.next() {
                Ok(frame) => {
                    let packet = decode_frame(frame, Utc::now(), self.preview_len);
                    self.counters.record(&packet);
                    self.bus.publish(packet);
                }
                Err(e) if is_read_timeout(&e) => continue,
                Err(e) => {
                    let message = e.to_string();
                    error!("Packet capture failed: {}", message);
                    self.running.store(false, Ordering::SeqCst);
                    self.state.send_replace(CaptureState::Stopped {
                        error: Some(message.clone()),
                    });
                    return Err(CaptureError::Read(message));
                }
            }
        }
        debug!("Capture loop exited");
        Ok(())
    }
}

fn is_read_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) || e.to_string().to_ascii_lowercase().contains("timed out")
}

// ── Frame Decoding ───────────────────────────────────────────────────────────

/// Decode one Ethernet frame. Every frame yields exactly one record; anything
/// that is not TCP, UDP, ICMP or ICMPv6 over IP is classified `OTHER`.
pub fn decode_frame(data: &[u8], timestamp: DateTime<Utc>, preview_len: usize) -> PacketInfo {
    let mut packet = PacketInfo {
        timestamp,
        length: data.len(),
        ..Default::default()
    };

    let Some(eth) = EthernetPacket::new(data) else {
        packet.info = format!("Truncated frame ({} bytes)", data.len());
        return packet;
    };

    packet.source = eth.get_source().to_string();
    packet.destination = eth.get_destination().to_string();

    match eth.get_ethertype() {
        EtherTypes::Ipv4 => match Ipv4Packet::new(eth.payload()) {
            Some(ip) => decode_ip(
                &mut packet,
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.get_next_level_protocol(),
                ip.payload(),
                preview_len,
            ),
            None => packet.info = String::from("Malformed IPv4 header"),
        },
        EtherTypes::Ipv6 => match Ipv6Packet::new(eth.payload()) {
            Some(ip) => decode_ip(
                &mut packet,
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.get_next_header(),
                ip.payload(),
                preview_len,
            ),
            None => packet.info = String::from("Malformed IPv6 header"),
        },
        EtherTypes::Arp => match ArpPacket::new(eth.payload()) {
            Some(arp) => {
                packet.source = arp.get_sender_proto_addr().to_string();
                packet.destination = arp.get_target_proto_addr().to_string();
                packet.info = if arp.get_operation() == ArpOperations::Reply {
                    format!(
                        "ARP {} is at {}",
                        arp.get_sender_proto_addr(),
                        arp.get_sender_hw_addr()
                    )
                } else {
                    format!(
                        "ARP who has {}? Tell {}",
                        arp.get_target_proto_addr(),
                        arp.get_sender_proto_addr()
                    )
                };
            }
            None => packet.info = String::from("Malformed ARP packet"),
        },
        other => packet.info = format!("EtherType 0x{:04x}", other.0),
    }

    packet
}

fn decode_ip(
    packet: &mut PacketInfo,
    src: IpAddr,
    dst: IpAddr,
    next: IpNextHeaderProtocol,
    payload: &[u8],
    preview_len: usize,
) {
    packet.source = src.to_string();
    packet.destination = dst.to_string();

    match next {
        IpNextHeaderProtocols::Tcp => {
            packet.protocol = Protocol::Tcp;
            match TcpPacket::new(payload) {
                Some(tcp) => {
                    packet.src_port = Some(tcp.get_source());
                    packet.dst_port = Some(tcp.get_destination());
                    packet.payload = excerpt(tcp.payload(), preview_len);
                    packet.info = format!(
                        "TCP {} -> {} [{}]",
                        SocketAddr::new(src, tcp.get_source()),
                        SocketAddr::new(dst, tcp.get_destination()),
                        format_tcp_flags(u16::from(tcp.get_flags()))
                    );
                }
                None => packet.info = format!("TCP {} -> {} (truncated)", src, dst),
            }
        }
        IpNextHeaderProtocols::Udp => {
            packet.protocol = Protocol::Udp;
            match UdpPacket::new(payload) {
                Some(udp) => {
                    packet.src_port = Some(udp.get_source());
                    packet.dst_port = Some(udp.get_destination());
                    packet.payload = excerpt(udp.payload(), preview_len);
                    packet.info = format!(
                        "UDP {} -> {}",
                        SocketAddr::new(src, udp.get_source()),
                        SocketAddr::new(dst, udp.get_destination())
                    );
                }
                None => packet.info = format!("UDP {} -> {} (truncated)", src, dst),
            }
        }
        IpNextHeaderProtocols::Icmp => {
            packet.protocol = Protocol::Icmp;
            packet.info = format!("ICMP {} -> {}", src, dst);
        }
        IpNextHeaderProtocols::Icmpv6 => {
            packet.protocol = Protocol::Icmpv6;
            packet.info = format!("ICMPv6 {} -> {}", src, dst);
        }
        other => {
            packet.protocol = Protocol::Other;
            packet.info = format!("IP protocol {} {} -> {}", other.0, src, dst);
        }
    }
}

/// Lossy text excerpt of at most `max` payload bytes
fn excerpt(payload: &[u8], max: usize) -> String {
    let take = payload.len().min(max);
    String::from_utf8_lossy(&payload[..take]).replace('\0', "")
}

fn format_tcp_flags(raw: u16) -> String {
    const FLAGS: [(u16, char); 6] = [
        (0x01, 'F'),
        (0x02, 'S'),
        (0x04, 'R'),
        (0x08, 'P'),
        (0x10, 'A'),
        (0x20, 'U'),
    ];

    let flags: String = FLAGS
        .iter()
        .filter(|(bit, _)| raw & bit != 0)
        .map(|(_, c)| *c)
        .collect();

    if flags.is_empty() {
        String::from("none")
    } else {
        flags
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::arp::{ArpHardwareTypes, MutableArpPacket};
    use pnet::packet::ethernet::{EtherType, MutableEthernetPacket};
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::ipv6::MutableIpv6Packet;
    use pnet::packet::tcp::MutableTcpPacket;
    use pnet::packet::udp::MutableUdpPacket;
    use pnet::util::MacAddr;
    use std::collections::VecDeque;
    use std::io;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SRC_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);
    const DST_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x02);

    fn ethernet(ethertype: EtherType, payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; 14 + payload_len];
        let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
        eth.set_source(SRC_MAC);
        eth.set_destination(DST_MAC);
        eth.set_ethertype(ethertype);
        buf
    }

    fn ipv4(
        transport_len: usize,
        proto: IpNextHeaderProtocol,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Vec<u8> {
        let total = 20 + transport_len;
        let mut buf = ethernet(EtherTypes::Ipv4, total);
        let mut ip = MutableIpv4Packet::new(&mut buf[14..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(proto);
        ip.set_source(src);
        ip.set_destination(dst);
        buf
    }

    fn tcp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = ipv4(
            20 + payload.len(),
            IpNextHeaderProtocols::Tcp,
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(93, 184, 216, 34),
        );
        let mut tcp = MutableTcpPacket::new(&mut buf[34..]).unwrap();
        tcp.set_source(51000);
        tcp.set_destination(dst_port);
        tcp.set_data_offset(5);
        tcp.set_flags(0x18);
        tcp.set_payload(payload);
        buf
    }

    fn udp_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = ipv4(
            8 + payload.len(),
            IpNextHeaderProtocols::Udp,
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(192, 168, 1, 1),
        );
        let mut udp = MutableUdpPacket::new(&mut buf[34..]).unwrap();
        udp.set_source(53000);
        udp.set_destination(53);
        udp.set_length((8 + payload.len()) as u16);
        udp.set_payload(payload);
        buf
    }

    fn arp_frame() -> Vec<u8> {
        let mut buf = ethernet(EtherTypes::Arp, 28);
        let mut arp = MutableArpPacket::new(&mut buf[14..]).unwrap();
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(SRC_MAC);
        arp.set_sender_proto_addr(Ipv4Addr::new(192, 168, 1, 10));
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(Ipv4Addr::new(192, 168, 1, 1));
        buf
    }

    fn icmpv6_frame() -> Vec<u8> {
        let mut buf = ethernet(EtherTypes::Ipv6, 40 + 8);
        let mut ip = MutableIpv6Packet::new(&mut buf[14..]).unwrap();
        ip.set_version(6);
        ip.set_payload_length(8);
        ip.set_next_header(IpNextHeaderProtocols::Icmpv6);
        ip.set_hop_limit(255);
        ip.set_source("fe80::1".parse::<Ipv6Addr>().unwrap());
        ip.set_destination("ff02::1".parse::<Ipv6Addr>().unwrap());
        buf
    }

    #[test]
    fn test_decode_tcp_with_payload() {
        let frame = tcp_frame(80, b"GET /login?user=bob HTTP/1.1\r\n");
        let pkt = decode_frame(&frame, Utc::now(), 256);

        assert_eq!(pkt.protocol, Protocol::Tcp);
        assert_eq!(pkt.source, "192.168.1.10");
        assert_eq!(pkt.destination, "93.184.216.34");
        assert_eq!(pkt.src_port, Some(51000));
        assert_eq!(pkt.dst_port, Some(80));
        assert_eq!(pkt.length, frame.len());
        assert!(pkt.payload.starts_with("GET /login?user=bob"));
        assert!(pkt.info.contains("[PA]"));
        assert_eq!(pkt.location, "??");
    }

    #[test]
    fn test_payload_is_bounded() {
        let frame = tcp_frame(8080, &[b'x'; 600]);
        let pkt = decode_frame(&frame, Utc::now(), 64);
        assert_eq!(pkt.payload.len(), 64);
        assert_eq!(pkt.length, frame.len());
    }

    #[test]
    fn test_decode_udp_and_icmpv6() {
        let pkt = decode_frame(&udp_frame(b"\x12\x34"), Utc::now(), 256);
        assert_eq!(pkt.protocol, Protocol::Udp);
        assert_eq!(pkt.dst_port, Some(53));

        let pkt = decode_frame(&icmpv6_frame(), Utc::now(), 256);
        assert_eq!(pkt.protocol, Protocol::Icmpv6);
        assert_eq!(pkt.source, "fe80::1");
        assert_eq!(pkt.src_port, None);
    }

    #[test]
    fn test_non_ip_frames_are_other() {
        let pkt = decode_frame(&arp_frame(), Utc::now(), 256);
        assert_eq!(pkt.protocol, Protocol::Other);
        assert_eq!(pkt.source, "192.168.1.10");
        assert!(pkt.info.starts_with("ARP who has 192.168.1.1"));

        let lldp = ethernet(EtherType(0x88cc), 32);
        let pkt = decode_frame(&lldp, Utc::now(), 256);
        assert_eq!(pkt.protocol, Protocol::Other);
        assert_eq!(pkt.source, SRC_MAC.to_string());

        let gre = ipv4(
            4,
            IpNextHeaderProtocols::Gre,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        assert_eq!(decode_frame(&gre, Utc::now(), 256).protocol, Protocol::Other);

        let truncated = decode_frame(&[0u8; 6], Utc::now(), 256);
        assert_eq!(truncated.protocol, Protocol::Other);
        assert_eq!(truncated.length, 6);
    }

    #[test]
    fn test_format_tcp_flags() {
        assert_eq!(format_tcp_flags(0x12), "SA");
        assert_eq!(format_tcp_flags(0x00), "none");
    }

    /// Replays frames, then idles with read timeouts or fails
    struct ScriptedReceiver {
        frames: VecDeque<Vec<u8>>,
        current: Vec<u8>,
        failure: Option<String>,
    }

    impl ScriptedReceiver {
        fn new(frames: Vec<Vec<u8>>, failure: Option<&str>) -> Box<Self> {
            Box::new(Self {
                frames: frames.into(),
                current: Vec::new(),
                failure: failure.map(String::from),
            })
        }
    }

    impl DataLinkReceiver for ScriptedReceiver {
        fn next(&mut self) -> io::Result<&[u8]> {
            if let Some(frame) = self.frames.pop_front() {
                self.current = frame;
                return Ok(&self.current);
            }
            if let Some(message) = self.failure.take() {
                return Err(io::Error::new(io::ErrorKind::Other, message));
            }
            std::thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(io::ErrorKind::TimedOut, "Timed out"))
        }
    }

    #[tokio::test]
    async fn test_capture_publishes_in_order_and_stops() {
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe();
        let capture = PacketCapture::new(CaptureConfig::default(), bus);
        assert_eq!(capture.state(), CaptureState::Idle);

        let frames = vec![tcp_frame(443, b""), udp_frame(b"q"), arp_frame()];
        capture
            .start_with_receiver("test0", ScriptedReceiver::new(frames, None))
            .unwrap();
        assert_eq!(capture.state(), CaptureState::Capturing);

        let mut protocols = Vec::new();
        for _ in 0..3 {
            let pkt = tokio::time::timeout(Duration::from_secs(2), sub.next())
                .await
                .unwrap()
                .unwrap();
            protocols.push(pkt.protocol);
        }
        assert_eq!(protocols, vec![Protocol::Tcp, Protocol::Udp, Protocol::Other]);

        let stats = capture.stop().await.unwrap();
        assert_eq!(stats.packets_captured, 3);
        assert_eq!(stats.protocol_breakdown.get("TCP"), Some(&1));
        assert_eq!(stats.interface.as_deref(), Some("test0"));
        assert_eq!(capture.state(), CaptureState::Stopped { error: None });

        let restart = capture.start_with_receiver("test0", ScriptedReceiver::new(vec![], None));
        assert!(matches!(restart, Err(CaptureError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_read_failure_is_fatal_and_surfaced() {
        let capture = PacketCapture::new(CaptureConfig::default(), EventBus::new(8));
        let mut states = capture.subscribe_state();

        capture
            .start_with_receiver(
                "test0",
                ScriptedReceiver::new(vec![udp_frame(b"x")], Some("interface vanished")),
            )
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| matches!(s, CaptureState::Stopped { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            capture.state(),
            CaptureState::Stopped {
                error: Some(String::from("interface vanished"))
            }
        );
        let err = capture.stop().await.unwrap_err();
        assert!(matches!(err, CaptureError::Read(ref m) if m == "interface vanished"));
    }

    #[tokio::test]
    async fn test_immediate_read_failure_is_never_masked() {
        for _ in 0..50 {
            let capture = PacketCapture::new(CaptureConfig::default(), EventBus::new(8));
            let mut states = capture.subscribe_state();

            capture
                .start_with_receiver("test0", ScriptedReceiver::new(vec![], Some("no such device")))
                .unwrap();

            tokio::time::timeout(
                Duration::from_secs(2),
                states.wait_for(|s| matches!(s, CaptureState::Stopped { .. })),
            )
            .await
            .unwrap()
            .unwrap();

            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(
                capture.state(),
                CaptureState::Stopped {
                    error: Some(String::from("no such device"))
                }
            );
            assert!(matches!(
                capture.start_with_receiver("test0", ScriptedReceiver::new(vec![], None)),
                Err(CaptureError::SessionClosed)
            ));
            assert!(matches!(capture.stop().await, Err(CaptureError::Read(_))));
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_missing_interface_fails() {
        let config = CaptureConfig {
            interface: Some(String::from("definitely-not-an-interface0")),
            ..Default::default()
        };
        let capture = PacketCapture::new(config, EventBus::new(8));
        assert!(matches!(
            capture.start(),
            Err(CaptureError::InterfaceNotFound(_))
        ));
        assert_eq!(capture.state(), CaptureState::Idle);

        capture
            .start_with_receiver("test0", ScriptedReceiver::new(vec![], None))
            .unwrap();
        assert!(capture.start().is_ok());
        assert!(capture.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let capture = PacketCapture::new(CaptureConfig::default(), EventBus::new(8));
        let stats = capture.stop().await.unwrap();
        assert_eq!(stats.packets_captured, 0);
        assert_eq!(capture.state(), CaptureState::Stopped { error: None });
    }
}
