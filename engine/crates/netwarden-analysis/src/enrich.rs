//! Location enrichment
//!
//! Maps an address to a coarse tag: `LOCAL`, `MCAST`, a country code, or
//! `UNKNOWN`. Local and multicast classification never touch the network.
//! External lookups go through a [`LocationProvider`], are rate-limited and
//! cached for the lifetime of the enricher.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use netwarden_common::config::GeoSettings;
use netwarden_core::PacketInfo;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, trace, warn};

pub const LOCAL: &str = "LOCAL";
pub const MCAST: &str = "MCAST";
pub const UNKNOWN: &str = "UNKNOWN";

// ── Classification ───────────────────────────────────────────────────────────

/// Offline classification of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Loopback, private, link-local or unique-local
    Local,
    /// Multicast or broadcast
    Multicast,
    /// Globally routable; needs an external lookup
    External(IpAddr),
    /// Not an IP address (empty, MAC, garbage)
    Invalid,
}

pub fn classify(address: &str) -> AddressClass {
    match address.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => classify_v4(ip),
        Ok(IpAddr::V6(ip)) => classify_v6(ip),
        Err(_) => AddressClass::Invalid,
    }
}

fn classify_v4(ip: Ipv4Addr) -> AddressClass {
    // 224.0.0.0/4 multicast and 240.0.0.0/4 reserved, broadcast included
    if ip.octets()[0] >= 224 {
        AddressClass::Multicast
    } else if ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() {
        AddressClass::Local
    } else {
        AddressClass::External(IpAddr::V4(ip))
    }
}

fn classify_v6(ip: Ipv6Addr) -> AddressClass {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_v4(v4);
    }

    let first = ip.segments()[0];
    if ip.is_multicast() {
        AddressClass::Multicast
    } else if ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
    {
        AddressClass::Local
    } else {
        AddressClass::External(IpAddr::V6(ip))
    }
}

// ── Providers ────────────────────────────────────────────────────────────────

/// Source of location tags for external addresses
#[async_trait]
pub trait LocationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve `ip` to a short location code
    async fn locate(&self, ip: IpAddr) -> anyhow::Result<String>;
}

/// ip-api.com JSON endpoint; returns the two-letter country code
pub struct IpApiProvider {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    message: Option<String>,
}

impl IpApiProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LocationProvider for IpApiProvider {
    fn name(&self) -> &str {
        "ip-api"
    }

    async fn locate(&self, ip: IpAddr) -> anyhow::Result<String> {
        let url = format!("{}/{}", self.endpoint, ip);
        let response: IpApiResponse = self
            .client
            .get(&url)
            .query(&[("fields", "status,message,countryCode")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.country_code {
            Some(code) if !code.is_empty() => Ok(code),
            _ => anyhow::bail!(
                "no country code for {}: {}",
                ip,
                response.message.unwrap_or_else(|| String::from("empty response"))
            ),
        }
    }
}

// ── Enricher ─────────────────────────────────────────────────────────────────

/// Caching, rate-limited address classifier
pub struct GeoEnricher {
    provider: Option<Arc<dyn LocationProvider>>,
    cache: RwLock<HashMap<IpAddr, String>>,
    min_interval: Duration,
    last_lookup: Mutex<Option<Instant>>,
}

impl GeoEnricher {
    /// Enricher that never performs external lookups
    pub fn offline() -> Self {
        Self {
            provider: None,
            cache: RwLock::new(HashMap::new()),
            min_interval: Duration::ZERO,
            last_lookup: Mutex::new(None),
        }
    }

    pub fn with_provider(provider: Arc<dyn LocationProvider>, min_interval: Duration) -> Self {
        Self {
            provider: Some(provider),
            min_interval,
            ..Self::offline()
        }
    }

    /// Build from the `[geo]` section. When the HTTP client cannot be
    /// created the enricher falls back to offline classification.
    pub fn from_settings(settings: &GeoSettings) -> Self {
        if !settings.enabled {
            return Self::offline();
        }

        match IpApiProvider::new(
            settings.endpoint.clone(),
            Duration::from_millis(settings.timeout_ms),
        ) {
            Ok(provider) => Self::with_provider(
                Arc::new(provider),
                Duration::from_millis(settings.min_interval_ms),
            ),
            Err(e) => {
                warn!("External location lookups disabled: {}", e);
                Self::offline()
            }
        }
    }

    /// Resolve one address to its location tag
    pub async fn resolve(&self, address: &str) -> String {
        let ip = match classify(address) {
            AddressClass::Local => return LOCAL.to_string(),
            AddressClass::Multicast => return MCAST.to_string(),
            AddressClass::Invalid => return UNKNOWN.to_string(),
            AddressClass::External(ip) => ip,
        };

        if let Some(tag) = self.cached(&ip) {
            return tag;
        }

        let Some(provider) = &self.provider else {
            return UNKNOWN.to_string();
        };

        if !self.acquire_slot() {
            // not cached: a later batch retries
            trace!("Location lookup for {} deferred by rate limit", ip);
            return UNKNOWN.to_string();
        }

        let tag = match provider.locate(ip).await {
            Ok(code) => {
                debug!("{} located as {} via {}", ip, code, provider.name());
                code
            }
            Err(e) => {
                debug!("Location lookup for {} failed: {}", ip, e);
                UNKNOWN.to_string()
            }
        };

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip, tag.clone());
        tag
    }

    /// Tag for a packet's remote endpoint: the destination, or the source
    /// when the destination is local.
    pub async fn locate_packet(&self, packet: &PacketInfo) -> String {
        let destination = self.resolve(&packet.destination).await;
        if destination == LOCAL && !packet.source.is_empty() {
            self.resolve(&packet.source).await
        } else {
            destination
        }
    }

    /// Number of cached external lookups
    pub fn cached_entries(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, ip: &IpAddr) -> Option<String> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ip)
            .cloned()
    }

    fn acquire_slot(&self) -> bool {
        let mut last = self.last_lookup.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for GeoEnricher {
    fn default() -> Self {
        Self::offline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticProvider {
        answer: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn new(answer: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LocationProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }

        async fn locate(&self, _ip: IpAddr) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answer {
                Some(code) => Ok(code.to_string()),
                None => anyhow::bail!("lookup failed"),
            }
        }
    }

    #[test]
    fn test_classify() {
        let locals = [
            "127.0.0.1",
            "10.1.2.3",
            "172.20.0.5",
            "192.168.1.1",
            "169.254.3.3",
            "::1",
            "fe80::1",
            "fd00::1",
        ];
        for local in locals {
            assert_eq!(classify(local), AddressClass::Local, "{local}");
        }
        let multicast = [
            "224.0.0.251",
            "239.255.255.250",
            "240.0.0.1",
            "250.1.2.3",
            "255.255.255.255",
            "ff02::1",
            "::ffff:240.0.0.9",
        ];
        for mcast in multicast {
            assert_eq!(classify(mcast), AddressClass::Multicast, "{mcast}");
        }
        assert!(matches!(classify("8.8.8.8"), AddressClass::External(_)));
        assert!(matches!(classify("223.255.255.254"), AddressClass::External(_)));
        assert!(matches!(classify("2001:4860:4860::8888"), AddressClass::External(_)));
        assert_eq!(classify("::ffff:192.168.1.5"), AddressClass::Local);
        assert_eq!(classify(""), AddressClass::Invalid);
        assert_eq!(classify("02:00:00:00:00:01"), AddressClass::Invalid);
    }

    #[tokio::test]
    async fn test_local_and_multicast_skip_provider() {
        let provider = StaticProvider::new(Some("US"));
        let enricher = GeoEnricher::with_provider(provider.clone(), Duration::ZERO);

        assert_eq!(enricher.resolve("192.168.1.10").await, LOCAL);
        assert_eq!(enricher.resolve("224.0.0.251").await, MCAST);
        assert_eq!(enricher.resolve("not-an-ip").await, UNKNOWN);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_external_lookup_is_cached() {
        let provider = StaticProvider::new(Some("DE"));
        let enricher = GeoEnricher::with_provider(provider.clone(), Duration::ZERO);

        assert_eq!(enricher.resolve("93.184.216.34").await, "DE");
        assert_eq!(enricher.resolve("93.184.216.34").await, "DE");
        assert_eq!(provider.calls(), 1);
        assert_eq!(enricher.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_cached_as_unknown() {
        let provider = StaticProvider::new(None);
        let enricher = GeoEnricher::with_provider(provider.clone(), Duration::ZERO);

        assert_eq!(enricher.resolve("8.8.8.8").await, UNKNOWN);
        assert_eq!(enricher.resolve("8.8.8.8").await, UNKNOWN);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_lookup_not_cached() {
        let provider = StaticProvider::new(Some("FR"));
        let enricher = GeoEnricher::with_provider(provider.clone(), Duration::from_secs(3600));

        assert_eq!(enricher.resolve("1.1.1.1").await, "FR");
        // second external address falls inside the interval
        assert_eq!(enricher.resolve("9.9.9.9").await, UNKNOWN);
        assert_eq!(provider.calls(), 1);
        assert_eq!(enricher.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_offline_and_packet_fallback() {
        let enricher = GeoEnricher::offline();
        assert_eq!(enricher.resolve("8.8.8.8").await, UNKNOWN);

        let inbound = PacketInfo {
            source: "224.0.0.251".into(),
            destination: "192.168.1.10".into(),
            ..Default::default()
        };
        assert_eq!(enricher.locate_packet(&inbound).await, MCAST);

        let lan = PacketInfo {
            source: "192.168.1.10".into(),
            destination: "192.168.1.1".into(),
            ..Default::default()
        };
        assert_eq!(enricher.locate_packet(&lan).await, LOCAL);
    }

    #[test]
    fn test_disabled_settings_are_offline() {
        let settings = GeoSettings {
            enabled: false,
            ..Default::default()
        };
        let enricher = GeoEnricher::from_settings(&settings);
        assert!(enricher.provider.is_none());
    }
}
