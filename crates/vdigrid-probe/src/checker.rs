//! TCP reachability probe.
//!
//! Opens a connection to a node's management port with a bounded timeout
//! and drops it immediately. Nothing is sent over the wire.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::resolve::{resolve_first_ipv4, ProbeError};

/// Result of a single connect probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The port accepted a connection.
    Reachable,
    /// Connection refused or reset.
    Refused,
    /// No answer within the timeout.
    TimedOut,
}

impl ProbeResult {
    pub fn is_reachable(self) -> bool {
        self == ProbeResult::Reachable
    }
}

/// Resolution and connect checks, as used by the scale cycle.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Resolve a host name to its first IPv4 address.
    async fn resolve(&self, host: &str) -> Result<IpAddr, ProbeError>;

    /// Attempt one TCP connect to `ip:port` within `timeout`.
    async fn probe(&self, ip: IpAddr, port: u16, timeout: Duration) -> ProbeResult;
}

/// Probe backed by the tokio resolver and `TcpStream::connect`.
#[derive(Debug, Clone)]
pub struct NetProbe {
    /// Upper bound on a single name lookup.
    resolve_timeout: Duration,
}

impl NetProbe {
    pub fn new(resolve_timeout: Duration) -> Self {
        Self { resolve_timeout }
    }
}

impl Default for NetProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl Reachability for NetProbe {
    async fn resolve(&self, host: &str) -> Result<IpAddr, ProbeError> {
        resolve_first_ipv4(host, self.resolve_timeout).await
    }

    async fn probe(&self, ip: IpAddr, port: u16, timeout: Duration) -> ProbeResult {
        tcp_probe(SocketAddr::new(ip, port), timeout).await
    }
}

/// Perform a TCP connect probe against `addr`.
pub async fn tcp_probe(addr: SocketAddr, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ProbeResult::Reachable,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "connect probe failed");
            ProbeResult::Refused
        }
        Err(_) => {
            debug!(%addr, ?timeout, "connect probe timed out");
            ProbeResult::TimedOut
        }
    }
}
