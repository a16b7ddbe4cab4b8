//! NetWarden - single-host network security monitor
//!
//! Command-line front end over `MonitorService`. Every subcommand prints
//! JSON on stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netwarden_common::logging::{init_logging_with_config, LogConfig, LogFormat};
use netwarden_common::Config;
use netwarden_core::{DiscoveryError, Error, PacketInfo, PortResult, ScanError, SecurityFinding};
use netwarden_monitor::MonitorService;
use netwarden_network::{CaptureState, CaptureStats};
use serde::Serialize;
use tracing::{error, info, warn};

/// NetWarden network security monitor
#[derive(Parser, Debug)]
#[command(name = "netwarden")]
#[command(version)]
#[command(about = "Discover hosts, scan ports, sniff traffic and flag risks", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/netwarden/netwarden.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json, compact); overrides the config
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate live hosts on the local subnet
    Discover {
        /// Sweep this CIDR block instead of the local subnet
        #[arg(long)]
        cidr: Option<String>,
    },

    /// Scan the TCP ports of one host
    Ports {
        address: String,

        /// Give up after this many seconds and print what finished
        #[arg(long)]
        deadline: Option<u64>,
    },

    /// Analyze port results and packets stored as JSON files
    Analyze {
        /// JSON array of port results
        #[arg(long)]
        ports: Option<PathBuf>,

        /// JSON array of packets
        #[arg(long)]
        packets: Option<PathBuf>,
    },

    /// Capture live traffic, streaming packets as JSON lines
    Sniff {
        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Block inbound traffic from an address
    Block { address: String },
}

#[derive(Serialize)]
struct SniffReport {
    stats: Option<CaptureStats>,
    findings: Vec<SecurityFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;

    let mut log_config = LogConfig::from_settings(&config.logging);
    if let Some(level) = &args.log_level {
        log_config = log_config.level(level);
    }
    if let Some(format) = &args.log_format {
        log_config = log_config.format(format.parse::<LogFormat>()?);
    }
    init_logging_with_config(log_config)?;

    info!("NetWarden {} starting", env!("CARGO_PKG_VERSION"));

    let service = MonitorService::new(config);

    match args.command {
        Command::Discover { cidr } => {
            let result = match cidr {
                Some(cidr) => service.scan_network(&cidr).await,
                None => service.start_network_scan().await,
            };
            let devices = match result {
                Ok(devices) => devices,
                Err(DiscoveryError::DeadlineExceeded { found }) => {
                    warn!("Discovery deadline exceeded, printing partial results");
                    found
                }
                Err(e) => return Err(failed(e)),
            };
            print_json(&devices)?;
        }

        Command::Ports { address, deadline } => {
            let result = match deadline {
                Some(secs) => {
                    service
                        .scan_device_ports_until(&address, Duration::from_secs(secs))
                        .await
                }
                None => service.scan_device_ports(&address).await,
            };
            let ports = match result {
                Ok(ports) => ports,
                Err(ScanError::DeadlineExceeded { completed, pending }) => {
                    warn!("{} ports still pending at the deadline", pending);
                    completed
                }
                Err(e) => return Err(failed(e)),
            };
            print_json(&ports)?;
        }

        Command::Analyze { ports, packets } => {
            let ports: Vec<PortResult> = read_json_list(ports.as_deref())?;
            let packets: Vec<PacketInfo> = read_json_list(packets.as_deref())?;
            let result = service.get_security_analysis(&ports, &packets).await;
            print_json(&result)?;
        }

        Command::Sniff { duration } => sniff(&service, duration.map(Duration::from_secs)).await?,

        Command::Block { address } => {
            let outcome = service.block_ip_address(&address).await.map_err(failed)?;
            info!("{}", outcome);
            print_json(&outcome)?;
        }
    }

    Ok(())
}

/// Log a failed operation with its error code
fn failed(err: impl Into<Error>) -> anyhow::Error {
    let err = err.into();
    error!(code = err.code(), "{}", err);
    err.into()
}

fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::from_file(path)?
    } else {
        Config::default()
    };
    let config = config.merge_env();
    config.validate()?;
    Ok(config)
}

async fn sniff(service: &MonitorService, duration: Option<Duration>) -> Result<()> {
    let mut packets = service.subscribe_packets();
    service.start_live_sniffing().await.map_err(failed)?;

    let stop = async {
        match duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    tokio::pin!(stop);
    let mut health = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut stop => break,
            packet = packets.next() => match packet {
                Some(packet) => println!("{}", serde_json::to_string(&packet)?),
                None => break,
            },
            _ = health.tick() => {
                if matches!(service.sniffer_state().await, CaptureState::Stopped { .. }) {
                    break;
                }
            }
        }
    }

    if packets.dropped() > 0 {
        warn!("Output fell behind; {} packets not printed", packets.dropped());
    }

    let outcome = service.stop_live_sniffing().await;
    let report = SniffReport {
        stats: outcome.as_ref().ok().cloned().flatten(),
        findings: service.findings(),
        error: outcome.as_ref().err().map(|e| e.to_string()),
    };
    print_json(&report)?;
    outcome.map_err(failed)?;
    Ok(())
}

/// A missing path means an empty list
fn read_json_list<T: serde::de::DeserializeOwned>(path: Option<&Path>) -> Result<Vec<T>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_json_list(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Parse a JSON array, skipping entries that do not form a record
fn parse_json_list<T: serde::de::DeserializeOwned>(content: &str) -> Result<Vec<T>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Option<Vec<serde_json::Value>> = serde_json::from_str(content)?;

    let mut records = Vec::new();
    for (index, entry) in entries.unwrap_or_default().into_iter().enumerate() {
        match serde_json::from_value(entry) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping entry {}: {}", index, e),
        }
    }
    Ok(records)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
