//! Boundary records: devices, port results and decoded packets
//!
//! Every record deserialises with missing fields defaulted, so partial input
//! from the presentation layer is treated as absent data rather than an error.
//! Packet fields also tolerate wrong types and legacy formats: a value that
//! cannot be read falls back to the field default.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::net::IpAddr;

/// Location tag carried by a packet before enrichment
pub const UNRESOLVED_LOCATION: &str = "??";

// ── Devices ──────────────────────────────────────────────────────────────────

/// A live host observed during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "ip", alias = "address")]
    pub address: IpAddr,
    /// Hardware address, empty when the neighbour cache had no entry
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub hostname: String,
    /// True for the host running the monitor
    #[serde(default)]
    pub local: bool,
}

impl Device {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            mac: String::new(),
            hostname: String::new(),
            local: false,
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }
}

// ── Port Results ─────────────────────────────────────────────────────────────

/// State of a probed port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    /// Handshake completed
    #[serde(alias = "Open")]
    Open,
    /// Connection refused
    #[default]
    #[serde(alias = "Closed")]
    Closed,
    /// No answer within the timeout, or an error other than a refusal
    #[serde(alias = "Filtered")]
    Filtered,
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Open => "open",
            PortStatus::Closed => "closed",
            PortStatus::Filtered => "filtered",
        }
    }
}

/// Result of probing a single port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortResult {
    pub port: u16,
    pub status: PortStatus,
    /// Best-effort service name, empty if the port is not in the service table
    pub service: String,
}

impl PortResult {
    pub fn open(port: u16) -> Self {
        Self {
            port,
            status: PortStatus::Open,
            service: String::new(),
        }
    }

    pub fn closed(port: u16) -> Self {
        Self {
            port,
            status: PortStatus::Closed,
            service: String::new(),
        }
    }

    pub fn filtered(port: u16) -> Self {
        Self {
            port,
            status: PortStatus::Filtered,
            service: String::new(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == PortStatus::Open
    }
}

// ── Packets ──────────────────────────────────────────────────────────────────

/// Protocol classification of a captured frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    /// ARP, non-IP frames and unrecognised IP protocols
    #[default]
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Icmpv6 => "ICMPv6",
            Protocol::Other => "OTHER",
        }
    }

    /// Map a wire label to a protocol; anything unrecognised is `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            "ICMP" => Protocol::Icmp,
            "ICMPV6" => Protocol::Icmpv6,
            _ => Protocol::Other,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(label) => Protocol::from_label(&label),
            _ => Protocol::Other,
        })
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketInfo {
    #[serde(deserialize_with = "lenient::timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(deserialize_with = "lenient::text")]
    pub source: String,
    #[serde(rename = "dest", alias = "destination", deserialize_with = "lenient::text")]
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient::port")]
    pub src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient::port")]
    pub dst_port: Option<u16>,
    pub protocol: Protocol,
    /// Size of the whole frame in bytes
    #[serde(deserialize_with = "lenient::length")]
    pub length: usize,
    /// Short decode summary
    #[serde(deserialize_with = "lenient::text")]
    pub info: String,
    /// Bounded excerpt of the transport payload
    #[serde(deserialize_with = "lenient::text")]
    pub payload: String,
    /// Location tag, set once by enrichment
    #[serde(deserialize_with = "lenient::location")]
    pub location: String,
}

impl Default for PacketInfo {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::default(),
            source: String::new(),
            destination: String::new(),
            src_port: None,
            dst_port: None,
            protocol: Protocol::Other,
            length: 0,
            info: String::new(),
            payload: String::new(),
            location: String::from(UNRESOLVED_LOCATION),
        }
    }
}

impl PacketInfo {
    /// Correlation key used to merge enriched packets back into a buffer
    pub fn key(&self) -> PacketKey {
        PacketKey {
            timestamp: self.timestamp,
            source: self.source.clone(),
            destination: self.destination.clone(),
        }
    }

    /// True if either endpoint uses `port`
    pub fn touches_port(&self, port: u16) -> bool {
        self.src_port == Some(port) || self.dst_port == Some(port)
    }

    pub fn is_enriched(&self) -> bool {
        !self.location.is_empty() && self.location != UNRESOLVED_LOCATION
    }
}

/// Packet identity: `(timestamp, source, destination)` compared by value.
///
/// Two distinct packets sharing all three fields are indistinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketKey {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub destination: String,
}

/// Field readers for packets that never fail on a present value
mod lenient {
    use super::*;

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => parse_timestamp(&s).unwrap_or_default(),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or_default(),
            _ => DateTime::default(),
        })
    }

    /// RFC 3339, a naive date-time, or a bare time of day. A time of day
    /// carries no date and is anchored to 1970-01-01.
    pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
        let time = NaiveTime::parse_from_str(s, "%H:%M:%S%.f").ok()?;
        Some(Utc.from_utc_datetime(&NaiveDate::default().and_time(time)))
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    pub fn location<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let location = text(d)?;
        Ok(if location.is_empty() {
            String::from(UNRESOLVED_LOCATION)
        } else {
            location
        })
    }

    pub fn port<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn length<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
                .and_then(|len| usize::try_from(len).ok())
                .unwrap_or(0),
            Value::String(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        })
    }
}
