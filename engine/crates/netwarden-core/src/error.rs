//! Error types for NetWarden
//!
//! Each boundary operation has its own error enum so callers can tell
//! "ran and found nothing" (an empty `Ok`) apart from a failed run.

use crate::model::{Device, PortResult};
use thiserror::Error;

/// Result type alias using NetWarden Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to enumerate hosts on the local subnet
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("No usable network interface: {0}")]
    NoInterface(String),

    #[error("Invalid address range: {0}")]
    InvalidRange(String),

    #[error("All {attempted} discovery probes failed: {last_error}")]
    AllProbesFailed { attempted: usize, last_error: String },

    /// The overall deadline expired; `found` holds hosts confirmed before it did.
    #[error("Discovery deadline exceeded ({} devices found)", .found.len())]
    DeadlineExceeded { found: Vec<Device> },
}

/// Failure to probe the ports of one target
#[derive(Error, Debug, Clone)]
pub enum ScanError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Target unreachable: {address} ({reason})")]
    Unreachable { address: String, reason: String },

    /// The caller deadline expired; `completed` holds probes that finished in time.
    #[error("Scan deadline exceeded ({} ports completed, {pending} pending)", .completed.len())]
    DeadlineExceeded {
        completed: Vec<PortResult>,
        pending: usize,
    },
}

/// Fatal failure of a capture session
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Failed to open capture channel: {0}")]
    ChannelOpen(String),

    #[error("Packet read failed: {0}")]
    Read(String),

    #[error("Capture session already finished")]
    SessionClosed,

    #[error("Capture thread error: {0}")]
    Thread(String),
}

/// Failure to enforce a block
#[derive(Error, Debug, Clone)]
pub enum BlockError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Blocking mechanism unavailable: {0}")]
    Unavailable(String),

    #[error("Block rejected for {address}: {reason}")]
    Rejected { address: String, reason: String },
}

/// NetWarden error types
#[derive(Error, Debug)]
pub enum Error {
    // === Operation Errors ===
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Block(#[from] BlockError),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },
}

impl Error {
    /// Get an error code for logging
    pub fn code(&self) -> &'static str {
        match self {
            Error::Discovery(DiscoveryError::NoInterface(_)) => "NO_INTERFACE",
            Error::Discovery(DiscoveryError::InvalidRange(_)) => "INVALID_RANGE",
            Error::Discovery(DiscoveryError::AllProbesFailed { .. }) => "PROBES_FAILED",
            Error::Discovery(DiscoveryError::DeadlineExceeded { .. }) => "DISCOVERY_DEADLINE",
            Error::Scan(ScanError::InvalidAddress(_)) => "INVALID_ADDRESS",
            Error::Scan(ScanError::Unreachable { .. }) => "TARGET_UNREACHABLE",
            Error::Scan(ScanError::DeadlineExceeded { .. }) => "SCAN_DEADLINE",
            Error::Capture(CaptureError::InterfaceNotFound(_)) => "INTERFACE_NOT_FOUND",
            Error::Capture(CaptureError::ChannelOpen(_)) => "CHANNEL_OPEN_FAILED",
            Error::Capture(CaptureError::Read(_)) => "CAPTURE_READ_FAILED",
            Error::Capture(CaptureError::SessionClosed) => "CAPTURE_CLOSED",
            Error::Capture(CaptureError::Thread(_)) => "CAPTURE_THREAD",
            Error::Block(BlockError::InvalidAddress(_)) => "INVALID_ADDRESS",
            Error::Block(BlockError::Unavailable(_)) => "BLOCK_UNAVAILABLE",
            Error::Block(BlockError::Rejected { .. }) => "BLOCK_REJECTED",
            Error::Configuration(_) => "CONFIG_ERROR",
            Error::InvalidConfig { .. } => "INVALID_CONFIG",
        }
    }
}
