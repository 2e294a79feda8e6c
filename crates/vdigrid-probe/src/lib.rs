//! vdigrid-probe — reachability checks for booting desktop nodes.
//!
//! A node counts as booted once its management port accepts a TCP
//! connection. Cloud drivers often hand back a DNS name rather than an
//! address, so the probe also resolves names, keeping the first IPv4
//! address returned.
//!
//! Neither step retries. A failed resolution or connect means "not ready
//! yet" and the caller tries again on its next cycle.

pub mod checker;
pub mod resolve;

pub use checker::{NetProbe, ProbeResult, Reachability};
pub use resolve::{Address, ProbeError};
