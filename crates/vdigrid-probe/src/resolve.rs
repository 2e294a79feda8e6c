//! Address classification and name resolution.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Errors raised while resolving a node address.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("lookup of {host} failed: {reason}")]
    Lookup { host: String, reason: String },

    #[error("no IPv4 address found for {0}")]
    Unresolved(String),

    #[error("lookup of {0} timed out")]
    Timeout(String),
}

/// A node address as reported by the fleet driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Already an IP literal.
    Ip(IpAddr),
    /// A cloud-assigned host name that must be resolved first.
    Name(String),
}

impl Address {
    /// Classify a driver-reported address.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Name(raw.to_string()),
        }
    }
}

/// Resolve `host` and return its first IPv4 address.
pub async fn resolve_first_ipv4(host: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| ProbeError::Timeout(host.to_string()))?;

    let addrs = lookup.map_err(|e| ProbeError::Lookup {
        host: host.to_string(),
        reason: e.to_string(),
    })?;

    let ip = first_ipv4(addrs.map(|sa| sa.ip()))
        .ok_or_else(|| ProbeError::Unresolved(host.to_string()))?;
    debug!(%host, %ip, "resolved node address");
    Ok(ip)
}

fn first_ipv4(addrs: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    addrs.into_iter().find(IpAddr::is_ipv4)
}
