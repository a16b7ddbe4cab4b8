//! NetWarden Network - Discovery, port scanning and live capture
//!
//! This crate provides the network-facing components:
//! - Host discovery on the local subnet (TCP reachability probes)
//! - Port scanning with a bounded probe pool
//! - Live packet capture decoding frames into `PacketInfo` records
//! - An in-process event bus distributing captured packets

pub mod bus;
pub mod capture;
pub mod discovery;
pub mod interface;
pub mod port_scan;
pub mod probe;
pub mod services;

pub use bus::{EventBus, Subscription};
pub use capture::{decode_frame, CaptureConfig, CaptureState, CaptureStats, PacketCapture};
pub use discovery::{DeviceDiscoverer, DiscoveryConfig};
pub use interface::{select_interface, LocalInterface};
pub use port_scan::{PortScanConfig, PortScanner};
pub use services::{parse_port_spec, service_name, DEFAULT_PORTS};

pub use pnet::datalink::DataLinkReceiver;
