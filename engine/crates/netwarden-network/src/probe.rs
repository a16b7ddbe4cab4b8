//! Single TCP connect probe shared by discovery and port scanning

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Outcome of one TCP connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Handshake completed
    Connected,
    /// RST received: the host is up, the port is closed
    Refused,
    /// No answer within the timeout
    TimedOut,
    /// The network reported the host or its network as unreachable
    Unreachable(String),
    /// The local stack could not send the probe at all
    LocalFailure(String),
}

impl ProbeOutcome {
    /// True if the remote host answered in any way
    pub fn host_answered(&self) -> bool {
        matches!(self, ProbeOutcome::Connected | ProbeOutcome::Refused)
    }
}

/// Attempt a TCP connection to `addr` within `limit`.
pub async fn tcp_probe(addr: SocketAddr, limit: Duration) -> ProbeOutcome {
    trace!("TCP connect probe {}", addr);

    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ProbeOutcome::Connected,
        Ok(Err(e)) => classify_connect_error(&e),
        Err(_) => ProbeOutcome::TimedOut,
    }
}

fn classify_connect_error(e: &std::io::Error) -> ProbeOutcome {
    match e.kind() {
        ErrorKind::ConnectionRefused => ProbeOutcome::Refused,
        ErrorKind::TimedOut => ProbeOutcome::TimedOut,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
            ProbeOutcome::Unreachable(e.to_string())
        }
        _ => ProbeOutcome::LocalFailure(e.to_string()),
    }
}
