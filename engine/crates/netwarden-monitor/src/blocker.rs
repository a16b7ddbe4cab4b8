//! IP blocking through the host firewall
//!
//! [`IpBlocker`] remembers what it blocked this session and is idempotent:
//! a second request for the same address reports `AlreadyBlocked` without
//! touching the firewall again. Enforcement is delegated to a
//! [`BlockBackend`]. Nothing is retried.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::process::Output;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use netwarden_common::config::BlockerSettings;
use netwarden_core::BlockError;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of a successful block request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BlockOutcome {
    Blocked { address: IpAddr, backend: String },
    AlreadyBlocked { address: IpAddr },
}

impl BlockOutcome {
    pub fn address(&self) -> IpAddr {
        match self {
            BlockOutcome::Blocked { address, .. } | BlockOutcome::AlreadyBlocked { address } => {
                *address
            }
        }
    }

    pub fn is_already_blocked(&self) -> bool {
        matches!(self, BlockOutcome::AlreadyBlocked { .. })
    }
}

impl fmt::Display for BlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockOutcome::Blocked { address, backend } => {
                write!(f, "IP {} blocked via {}", address, backend)
            }
            BlockOutcome::AlreadyBlocked { address } => {
                write!(f, "IP {} is already blocked", address)
            }
        }
    }
}

// ── Backends ─────────────────────────────────────────────────────────────────

/// What a backend did to the firewall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleChange {
    Added,
    /// A matching rule was already installed, e.g. by an earlier run
    AlreadyPresent,
}

/// Platform firewall mechanism
#[async_trait]
pub trait BlockBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Drop all inbound traffic from `address`
    async fn block(&self, address: IpAddr) -> Result<RuleChange, BlockError>;
}

/// Linux iptables / ip6tables
pub struct IptablesBackend {
    chain: String,
    use_sudo: bool,
}

impl IptablesBackend {
    pub fn new(chain: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            chain: chain.into(),
            use_sudo,
        }
    }

    fn command(&self, address: IpAddr, action: &str) -> (String, Vec<String>) {
        let tool = match address {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        };
        let mut args: Vec<String> = vec![
            action.to_string(),
            self.chain.clone(),
            "-s".into(),
            address.to_string(),
            "-j".into(),
            "DROP".into(),
        ];

        if self.use_sudo {
            args.splice(0..0, ["-n".to_string(), tool.to_string()]);
            ("sudo".to_string(), args)
        } else {
            (tool.to_string(), args)
        }
    }
}

#[async_trait]
impl BlockBackend for IptablesBackend {
    fn name(&self) -> &str {
        "iptables"
    }

    async fn block(&self, address: IpAddr) -> Result<RuleChange, BlockError> {
        let (program, args) = self.command(address, "-C");
        if let Ok(output) = Command::new(&program).args(&args).output().await {
            if output.status.success() {
                debug!("DROP rule for {} already present", address);
                return Ok(RuleChange::AlreadyPresent);
            }
        }

        let (program, args) = self.command(address, "-A");
        run(&program, &args, address).await?;
        Ok(RuleChange::Added)
    }
}

/// Windows Defender Firewall through netsh
pub struct NetshBackend {
    rule_prefix: String,
}

impl NetshBackend {
    pub fn new(rule_prefix: impl Into<String>) -> Self {
        Self {
            rule_prefix: rule_prefix.into(),
        }
    }

    fn rule_args(&self, address: IpAddr, direction: &str) -> Vec<String> {
        let suffix = if direction == "out" { "_OUT" } else { "" };
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "add".into(),
            "rule".into(),
            format!("name={}_{}{}", self.rule_prefix, address, suffix),
            format!("dir={}", direction),
            "action=block".into(),
            format!("remoteip={}", address),
        ]
    }
}

#[async_trait]
impl BlockBackend for NetshBackend {
    fn name(&self) -> &str {
        "netsh"
    }

    async fn block(&self, address: IpAddr) -> Result<RuleChange, BlockError> {
        run("netsh", &self.rule_args(address, "in"), address).await?;

        if let Err(e) = run("netsh", &self.rule_args(address, "out"), address).await {
            warn!("Outbound block rule for {} not added: {}", address, e);
        }
        Ok(RuleChange::Added)
    }
}

/// Records requests without touching the firewall
#[derive(Default)]
pub struct DryRunBackend {
    applied: StdMutex<Vec<IpAddr>>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses passed to the backend, in request order
    pub fn applied(&self) -> Vec<IpAddr> {
        self.applied
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlockBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn block(&self, address: IpAddr) -> Result<RuleChange, BlockError> {
        info!("[dry-run] would block {}", address);
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(address);
        Ok(RuleChange::Added)
    }
}

async fn run(program: &str, args: &[String], address: IpAddr) -> Result<(), BlockError> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                BlockError::Unavailable(format!("{} not found", program))
            }
            _ => BlockError::Unavailable(format!("{}: {}", program, e)),
        })?;

    check_output(&output, address)
}

fn check_output(output: &Output, address: IpAddr) -> Result<(), BlockError> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let reason = [stderr.trim(), stdout.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("exited with {}", output.status));

    let lower = reason.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("must be root")
        || lower.contains("requires elevation")
        || lower.contains("password is required")
    {
        return Err(BlockError::Unavailable(reason));
    }

    Err(BlockError::Rejected {
        address: address.to_string(),
        reason,
    })
}

// ── Blocker ──────────────────────────────────────────────────────────────────

/// Session-scoped, idempotent IP blocker
pub struct IpBlocker {
    backend: Arc<dyn BlockBackend>,
    blocked: Mutex<HashSet<IpAddr>>,
}

impl IpBlocker {
    pub fn new(backend: Arc<dyn BlockBackend>) -> Self {
        Self {
            backend,
            blocked: Mutex::new(HashSet::new()),
        }
    }

    /// Backend chosen by the `[blocker]` section. `auto` picks iptables on
    /// Linux and netsh on Windows; other platforms fall back to dry-run.
    pub fn from_settings(settings: &BlockerSettings) -> Self {
        let backend: Arc<dyn BlockBackend> = match settings.backend.as_str() {
            "iptables" => Arc::new(IptablesBackend::new(&settings.chain, settings.use_sudo)),
            "netsh" => Arc::new(NetshBackend::new(&settings.rule_prefix)),
            "dry-run" => Arc::new(DryRunBackend::new()),
            _ if cfg!(target_os = "linux") => {
                Arc::new(IptablesBackend::new(&settings.chain, settings.use_sudo))
            }
            _ if cfg!(target_os = "windows") => Arc::new(NetshBackend::new(&settings.rule_prefix)),
            other => {
                warn!("No firewall backend for '{}' on this platform, using dry-run", other);
                Arc::new(DryRunBackend::new())
            }
        };
        Self::new(backend)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Block `address`. Calling again for the same address succeeds with
    /// `AlreadyBlocked`.
    pub async fn block(&self, address: &str) -> Result<BlockOutcome, BlockError> {
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| BlockError::InvalidAddress(address.to_string()))?;
        if ip.is_unspecified() || ip.is_loopback() {
            return Err(BlockError::InvalidAddress(address.to_string()));
        }

        // held across the backend call so concurrent requests serialise
        let mut blocked = self.blocked.lock().await;
        if blocked.contains(&ip) {
            return Ok(BlockOutcome::AlreadyBlocked { address: ip });
        }

        let change = self.backend.block(ip).await?;
        blocked.insert(ip);

        match change {
            RuleChange::Added => {
                info!("Blocked {} via {}", ip, self.backend.name());
                Ok(BlockOutcome::Blocked {
                    address: ip,
                    backend: self.backend.name().to_string(),
                })
            }
            RuleChange::AlreadyPresent => {
                info!("{} was already blocked by an existing rule", ip);
                Ok(BlockOutcome::AlreadyBlocked { address: ip })
            }
        }
    }

    pub async fn is_blocked(&self, address: IpAddr) -> bool {
        self.blocked.lock().await.contains(&address)
    }

    /// Addresses blocked this session, sorted
    pub async fn blocked(&self) -> Vec<IpAddr> {
        let mut list: Vec<IpAddr> = self.blocked.lock().await.iter().copied().collect();
        list.sort();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBackend;

    #[async_trait]
    impl BlockBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn block(&self, _address: IpAddr) -> Result<RuleChange, BlockError> {
            Err(BlockError::Unavailable("firewall service stopped".into()))
        }
    }

    /// Firewall that already holds a rule for every address
    struct PreloadedBackend;

    #[async_trait]
    impl BlockBackend for PreloadedBackend {
        fn name(&self) -> &str {
            "preloaded"
        }

        async fn block(&self, _address: IpAddr) -> Result<RuleChange, BlockError> {
            Ok(RuleChange::AlreadyPresent)
        }
    }

    #[tokio::test]
    async fn test_rule_from_earlier_run_is_already_blocked() {
        let blocker = IpBlocker::new(Arc::new(PreloadedBackend));
        let outcome = blocker.block("203.0.113.9").await.unwrap();
        assert!(outcome.is_already_blocked());
        assert!(blocker.is_blocked("203.0.113.9".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_block_twice_reports_already_blocked() {
        let backend = Arc::new(DryRunBackend::new());
        let blocker = IpBlocker::new(backend.clone());

        let first = blocker.block("203.0.113.9").await.unwrap();
        assert!(matches!(first, BlockOutcome::Blocked { .. }));

        let second = blocker.block("203.0.113.9").await.unwrap();
        assert!(second.is_already_blocked());
        assert_eq!(second.to_string(), "IP 203.0.113.9 is already blocked");

        assert_eq!(backend.applied().len(), 1);
        assert!(blocker.is_blocked("203.0.113.9".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_invalid_addresses() {
        let blocker = IpBlocker::new(Arc::new(DryRunBackend::new()));
        for bad in ["", "not-an-ip", "127.0.0.1", "0.0.0.0", "::1"] {
            assert!(
                matches!(blocker.block(bad).await, Err(BlockError::InvalidAddress(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn test_backend_failure_is_not_recorded() {
        let blocker = IpBlocker::new(Arc::new(FailingBackend));
        let err = blocker.block("198.51.100.1").await.unwrap_err();
        assert!(matches!(err, BlockError::Unavailable(_)));
        assert!(blocker.blocked().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let err = run(
            "netwarden-no-such-firewall-tool",
            &[],
            "198.51.100.1".parse().unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BlockError::Unavailable(_)));
    }

    #[test]
    fn test_iptables_command_line() {
        let backend = IptablesBackend::new("INPUT", true);
        let (program, args) = backend.command("203.0.113.9".parse().unwrap(), "-A");
        assert_eq!(program, "sudo");
        assert_eq!(
            args,
            ["-n", "iptables", "-A", "INPUT", "-s", "203.0.113.9", "-j", "DROP"]
        );

        let (program, _) = IptablesBackend::new("INPUT", false)
            .command("2001:db8::1".parse().unwrap(), "-A");
        assert_eq!(program, "ip6tables");
    }

    #[test]
    fn test_netsh_rule_names() {
        let backend = NetshBackend::new("NetWarden_Block");
        let args = backend.rule_args("203.0.113.9".parse().unwrap(), "out");
        assert!(args.contains(&"name=NetWarden_Block_203.0.113.9_OUT".to_string()));
        assert!(args.contains(&"remoteip=203.0.113.9".to_string()));
    }

    #[test]
    fn test_dry_run_from_settings() {
        let settings = BlockerSettings {
            backend: "dry-run".into(),
            ..Default::default()
        };
        assert_eq!(IpBlocker::from_settings(&settings).backend_name(), "dry-run");
    }
}
