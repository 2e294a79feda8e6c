//! Collaborators the scale cycle drives.
//!
//! The cycle never talks to a cloud API or a desktop host directly. It goes
//! through these traits so the daemon can plug in real implementations and
//! tests can plug in scripted ones.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use vdigrid_state::{Application, Instance};

use crate::cluster::ClusterView;

/// Address/status of one node as reported by the fleet driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub instance_id: String,
    /// Public addresses, most preferred first. May be DNS names.
    pub public_addresses: Vec<String>,
}

/// Errors reported by a fleet driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("start failed: {0}")]
    Start(String),

    #[error("list failed: {0}")]
    List(String),

    #[error("terminate failed: {0}")]
    Terminate(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Starts, lists and terminates compute nodes.
#[async_trait]
pub trait FleetDriver: Send + Sync {
    /// Launch one node for `app`. Returns as soon as the provider accepted
    /// the request, with the new node's instance id.
    async fn start_node(&self, app: &Application) -> DriverResult<String>;

    /// Current address information for the given instance ids. Unknown ids
    /// are omitted from the result.
    async fn list_instances(&self, instance_ids: &[String]) -> DriverResult<Vec<NodeInfo>>;

    /// Request termination of the given nodes.
    async fn terminate_instances(&self, instances: &[Instance]) -> DriverResult<()>;
}

/// Key material used to reach a node's management channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub key_path: PathBuf,
}

impl Credential {
    /// Resolve an application's key reference against `key_dir`.
    pub fn for_application(key_dir: &Path, app: &Application) -> Self {
        Self {
            key_path: key_dir.join(&app.ssh_key),
        }
    }
}

/// Errors reported by a session inspector.
#[derive(Debug, Error)]
pub enum InspectError {
    /// The node did not answer on its management channel.
    #[error("host {0} is not connectable")]
    NotConnectable(String),

    #[error("session query on {host} failed: {reason}")]
    Other { host: String, reason: String },
}

/// Counts live desktop sessions on a node.
#[async_trait]
pub trait SessionInspector: Send + Sync {
    async fn sessions(&self, ip: &str, credential: &Credential) -> Result<u32, InspectError>;
}

/// Logs idle users out across a cluster.
#[async_trait]
pub trait IdleSessionReaper: Send + Sync {
    async fn logout_idle_users(
        &self,
        cluster: &ClusterView,
        credential: &Credential,
    ) -> anyhow::Result<()>;
}

/// Per-node connection bookkeeping run on every active node each cycle.
#[async_trait]
pub trait ConnectionProcessor: Send + Sync {
    async fn process_connections(
        &self,
        node: &Instance,
        credential: &Credential,
    ) -> anyhow::Result<()>;
}

/// Hooks that do nothing. Used when no idle-logout or connection command is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl IdleSessionReaper for NoopHooks {
    async fn logout_idle_users(&self, _: &ClusterView, _: &Credential) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ConnectionProcessor for NoopHooks {
    async fn process_connections(&self, _: &Instance, _: &Credential) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_joins_key_dir() {
        let app = Application {
            id: "office".to_string(),
            name: "office".to_string(),
            scale_interarrival: 60,
            users_per_small: 4,
            cluster_headroom: 4,
            next_run_at: 0,
            ssh_key: "office.pem".to_string(),
            created_at: 0,
            updated_at: 0,
        };
        let cred = Credential::for_application(Path::new("/etc/vdigrid/keys"), &app);
        assert_eq!(cred.key_path, PathBuf::from("/etc/vdigrid/keys/office.pem"));
    }
}
