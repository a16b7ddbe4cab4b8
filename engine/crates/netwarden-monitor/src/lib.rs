//! NetWarden Monitor - ties discovery, scanning, capture, analysis and
//! blocking together behind [`MonitorService`]
//!
//! A live capture owns one [`MonitorSession`]: a coordinator task that keeps
//! the rolling packet buffer and the deduplicated finding history, and runs
//! batch analysis on a timer.

pub mod blocker;
pub mod service;
pub mod session;
pub mod state;

pub use blocker::{
    BlockBackend, BlockOutcome, DryRunBackend, IpBlocker, IptablesBackend, NetshBackend,
    RuleChange,
};
pub use service::MonitorService;
pub use session::{MonitorSession, SessionConfig, SessionView, SharedPorts};
pub use state::{DedupPolicy, FindingLog, PacketBuffer};
