//! NetWarden Core - Foundation types and error handling
//!
//! This crate provides the records exchanged between every NetWarden component:
//! - `Device`: a live host found during discovery
//! - `PortResult`: the classified state of one probed port
//! - `PacketInfo`: one decoded frame from live capture
//! - `SecurityFinding`, `AnalysisResult`: the output of the rule engine
//! - `RiskLevel`, `FindingType`: classification enums

pub mod error;
pub mod finding;
pub mod model;
pub mod risk;

// Re-export commonly used types at crate root
pub use error::{BlockError, CaptureError, DiscoveryError, Error, Result, ScanError};
pub use finding::{AnalysisResult, FindingBuilder, FindingKey, SecurityFinding};
pub use model::{Device, PacketInfo, PacketKey, PortResult, PortStatus, Protocol};
pub use risk::{FindingType, RiskLevel};
