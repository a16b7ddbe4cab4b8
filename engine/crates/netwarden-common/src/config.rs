//! Configuration management for NetWarden components
//!
//! Loaded from a TOML file, every field optional, then overridden by
//! `NETWARDEN_*` environment variables.

use netwarden_core::{Error, Result, RiskLevel};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Port scanner settings
    #[serde(default)]
    pub scanner: ScannerSettings,

    /// Live capture settings
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Rule engine and periodic analysis
    #[serde(default)]
    pub analysis: AnalysisSettings,

    /// Location enrichment
    #[serde(default)]
    pub geo: GeoSettings,

    #[serde(default)]
    pub blocker: BlockerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Reject values the runtime components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.discovery.concurrency == 0 {
            return Err(invalid("discovery.concurrency", "must be at least 1"));
        }
        if self.discovery.probe_ports.is_empty() {
            return Err(invalid("discovery.probe_ports", "must not be empty"));
        }
        if !(16..=30).contains(&self.discovery.min_prefix_len) {
            return Err(invalid("discovery.min_prefix_len", "must be between 16 and 30"));
        }
        if self.scanner.concurrency == 0 {
            return Err(invalid("scanner.concurrency", "must be at least 1"));
        }
        if self.capture.bus_capacity == 0 {
            return Err(invalid("capture.bus_capacity", "must be at least 1"));
        }
        if self.analysis.batch_size == 0 {
            return Err(invalid("analysis.batch_size", "must be at least 1"));
        }
        if self.analysis.buffer_capacity < self.analysis.batch_size {
            return Err(invalid(
                "analysis.buffer_capacity",
                "must not be smaller than analysis.batch_size",
            ));
        }
        if self.analysis.interval_ms == 0 {
            return Err(invalid("analysis.interval_ms", "must be positive"));
        }
        if !matches!(self.analysis.dedup.as_str(), "structured" | "summary") {
            return Err(invalid(
                "analysis.dedup",
                "expected \"structured\" or \"summary\"",
            ));
        }
        if !matches!(
            self.blocker.backend.as_str(),
            "auto" | "iptables" | "netsh" | "dry-run"
        ) {
            return Err(invalid(
                "blocker.backend",
                "expected one of auto, iptables, netsh, dry-run",
            ));
        }
        Ok(())
    }

    /// Merge with environment variables (NETWARDEN_ prefix)
    pub fn merge_env(mut self) -> Self {
        // Interface selection applies to both discovery and capture
        if let Ok(val) = std::env::var("NETWARDEN_INTERFACE") {
            self.discovery.interface = Some(val.clone());
            self.capture.interface = Some(val);
        }

        // Scanner
        if let Ok(val) = std::env::var("NETWARDEN_SCAN_PORTS") {
            self.scanner.ports = Some(val);
        }
        if let Ok(val) = std::env::var("NETWARDEN_SCAN_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.scanner.timeout_ms = n;
            }
        }

        // Analysis
        if let Ok(val) = std::env::var("NETWARDEN_ANALYSIS_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.analysis.interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("NETWARDEN_DEDUP") {
            self.analysis.dedup = val;
        }

        // Geo
        if let Ok(val) = std::env::var("NETWARDEN_GEO_ENABLED") {
            if let Ok(b) = val.parse() {
                self.geo.enabled = b;
            }
        }

        // Blocker
        if let Ok(val) = std::env::var("NETWARDEN_BLOCK_BACKEND") {
            self.blocker.backend = val;
        }

        // Logging
        if let Ok(val) = std::env::var("NETWARDEN_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("NETWARDEN_LOG_FORMAT") {
            self.logging.format = val;
        }

        self
    }
}

fn invalid(key: &str, message: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn default_true() -> bool {
    true
}

// ── Discovery ────────────────────────────────────────────────────────────────

/// Host discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Interface name; auto-detected when unset
    pub interface: Option<String>,

    /// TCP ports used as reachability probes
    #[serde(default = "default_probe_ports")]
    pub probe_ports: Vec<u16>,

    /// Timeout per probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Maximum concurrent host probes
    #[serde(default = "default_discovery_concurrency")]
    pub concurrency: usize,

    /// Overall discovery deadline in seconds
    #[serde(default = "default_discovery_deadline")]
    pub deadline_secs: u64,

    /// Wider subnets are narrowed to this prefix around the local address
    #[serde(default = "default_min_prefix")]
    pub min_prefix_len: u8,

    /// Report the monitoring host itself
    #[serde(default = "default_true")]
    pub include_local: bool,

    /// Fill hardware addresses from the OS neighbour cache
    #[serde(default = "default_true")]
    pub resolve_mac: bool,
}

fn default_probe_ports() -> Vec<u16> {
    vec![80, 443, 22, 445, 139, 3389, 8080, 62078]
}

fn default_probe_timeout() -> u64 {
    500
}

fn default_discovery_concurrency() -> usize {
    64
}

fn default_discovery_deadline() -> u64 {
    30
}

fn default_min_prefix() -> u8 {
    24
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            interface: None,
            probe_ports: default_probe_ports(),
            probe_timeout_ms: default_probe_timeout(),
            concurrency: default_discovery_concurrency(),
            deadline_secs: default_discovery_deadline(),
            min_prefix_len: default_min_prefix(),
            include_local: true,
            resolve_mac: true,
        }
    }
}

// ── Scanner ──────────────────────────────────────────────────────────────────

/// Port scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Port specification such as "21-23,80,443"; the built-in common
    /// service list is used when unset
    pub ports: Option<String>,

    /// Timeout per port in milliseconds
    #[serde(default = "default_scan_timeout")]
    pub timeout_ms: u64,

    /// Maximum concurrent probes per host
    #[serde(default = "default_scan_concurrency")]
    pub concurrency: usize,
}

fn default_scan_timeout() -> u64 {
    1000
}

fn default_scan_concurrency() -> usize {
    32
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            ports: None,
            timeout_ms: default_scan_timeout(),
            concurrency: default_scan_concurrency(),
        }
    }
}

// ── Capture ──────────────────────────────────────────────────────────────────

/// Live capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Interface name; auto-detected when unset
    pub interface: Option<String>,

    #[serde(default = "default_true")]
    pub promiscuous: bool,

    /// Maximum payload bytes kept per packet
    #[serde(default = "default_payload_preview")]
    pub payload_preview_len: usize,

    /// Read timeout of the capture channel; bounds how quickly stop() returns
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Events a subscriber may lag behind before the oldest are dropped
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_payload_preview() -> usize {
    256
}

fn default_read_timeout() -> u64 {
    100
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: None,
            promiscuous: true,
            payload_preview_len: default_payload_preview(),
            read_timeout_ms: default_read_timeout(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

// ── Analysis ─────────────────────────────────────────────────────────────────

/// Additional credential pattern for the packet rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPatternSettings {
    pub name: String,
    /// Regular expression matched against the payload excerpt
    pub pattern: String,
    #[serde(default = "default_pattern_risk")]
    pub risk: RiskLevel,
}

fn default_pattern_risk() -> RiskLevel {
    RiskLevel::Critical
}

/// Rule engine and periodic analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Period of the batch analysis task in milliseconds
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Upper bound for the interval when analysis runs slow
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Most recent packets analysed per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rolling packet buffer size
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Distinct external destinations per batch above which a
    /// network-activity finding is raised
    #[serde(default = "default_external_threshold")]
    pub external_destination_threshold: usize,

    /// Finding dedup key: "structured" or "summary"
    #[serde(default = "default_dedup")]
    pub dedup: String,

    /// Extra credential patterns appended to the built-in ones
    #[serde(default)]
    pub credential_patterns: Vec<CredentialPatternSettings>,
}

fn default_interval() -> u64 {
    3000
}

fn default_max_interval() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    30
}

fn default_buffer_capacity() -> usize {
    100
}

fn default_external_threshold() -> usize {
    3
}

fn default_dedup() -> String {
    String::from("structured")
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            max_interval_ms: default_max_interval(),
            batch_size: default_batch_size(),
            buffer_capacity: default_buffer_capacity(),
            external_destination_threshold: default_external_threshold(),
            dedup: default_dedup(),
            credential_patterns: vec![],
        }
    }
}

// ── Geo ──────────────────────────────────────────────────────────────────────

/// Location enrichment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoSettings {
    /// Query the external provider for public addresses
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lookup endpoint; the address is appended as a path segment
    #[serde(default = "default_geo_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_geo_timeout")]
    pub timeout_ms: u64,

    /// Minimum spacing between external lookups
    #[serde(default = "default_geo_interval")]
    pub min_interval_ms: u64,
}

fn default_geo_endpoint() -> String {
    String::from("http://ip-api.com/json")
}

fn default_geo_timeout() -> u64 {
    200
}

fn default_geo_interval() -> u64 {
    1400
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_geo_endpoint(),
            timeout_ms: default_geo_timeout(),
            min_interval_ms: default_geo_interval(),
        }
    }
}

// ── Blocker ──────────────────────────────────────────────────────────────────

/// Block enforcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerSettings {
    /// "auto", "iptables", "netsh" or "dry-run"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Prefix firewall commands with sudo
    #[serde(default)]
    pub use_sudo: bool,

    /// iptables chain receiving the DROP rule
    #[serde(default = "default_chain")]
    pub chain: String,

    /// netsh rule name prefix
    #[serde(default = "default_rule_prefix")]
    pub rule_prefix: String,
}

fn default_backend() -> String {
    String::from("auto")
}

fn default_chain() -> String {
    String::from("INPUT")
}

fn default_rule_prefix() -> String {
    String::from("NetWarden_Block")
}

impl Default for BlockerSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            use_sudo: false,
            chain: default_chain(),
            rule_prefix: default_rule_prefix(),
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────────────────

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("pretty")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Builder for constructing Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn interface(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.config.discovery.interface = Some(name.clone());
        self.config.capture.interface = Some(name);
        self
    }

    pub fn scan_ports(mut self, spec: impl Into<String>) -> Self {
        self.config.scanner.ports = Some(spec.into());
        self
    }

    pub fn scan_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.scanner.timeout_ms = timeout_ms;
        self
    }

    pub fn analysis_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.analysis.interval_ms = interval_ms;
        self
    }

    pub fn dedup(mut self, policy: impl Into<String>) -> Self {
        self.config.analysis.dedup = policy.into();
        self
    }

    pub fn geo_enabled(mut self, enabled: bool) -> Self {
        self.config.geo.enabled = enabled;
        self
    }

    pub fn block_backend(mut self, backend: impl Into<String>) -> Self {
        self.config.blocker.backend = backend.into();
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
