//! SSH-backed session inspection and per-node hooks.
//!
//! Every remote call is a single `ssh` invocation in batch mode, bounded by
//! a local timeout on top of ssh's own `ConnectTimeout`.

use std::path::Path;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use vdigrid_autoscale::{
    ClusterView, ConnectionProcessor, Credential, IdleSessionReaper, InspectError,
    SessionInspector,
};
use vdigrid_state::Instance;

use crate::config::DaemonConfig;

/// ssh's exit status for connection-level failures.
const SSH_CONNECT_FAILURE: i32 = 255;

/// Runs one command on a node over ssh.
#[derive(Debug, Clone)]
pub struct SshRunner {
    program: String,
    user: String,
    connect_timeout: Duration,
}

impl SshRunner {
    pub fn new(user: &str, connect_timeout: Duration) -> Self {
        Self {
            program: "ssh".to_string(),
            user: user.to_string(),
            connect_timeout,
        }
    }

    /// Use a different client binary.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn args(&self, ip: &str, key_path: &Path, command: &str) -> Vec<String> {
        vec![
            "-i".to_string(),
            key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            format!("{}@{}", self.user, ip),
            command.to_string(),
        ]
    }

    /// Run `command` on `ip` and return its stdout.
    pub async fn run(
        &self,
        ip: &str,
        credential: &Credential,
        command: &str,
    ) -> Result<String, InspectError> {
        let args = self.args(ip, &credential.key_path, command);
        debug!(%ip, %command, "ssh");

        let child = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output();
        // Allow the remote command some time beyond the connect phase.
        let limit = self.connect_timeout * 2;
        match tokio::time::timeout(limit, child).await {
            Err(_) => Err(InspectError::NotConnectable(ip.to_string())),
            Ok(Err(e)) => Err(InspectError::Other {
                host: ip.to_string(),
                reason: format!("{}: {e}", self.program),
            }),
            Ok(Ok(output)) => interpret(ip, &output),
        }
    }
}

/// Map an ssh process outcome onto stdout or an inspection error.
pub fn interpret(host: &str, output: &Output) -> Result<String, InspectError> {
    match output.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        Some(SSH_CONNECT_FAILURE) => Err(InspectError::NotConnectable(host.to_string())),
        Some(code) => Err(InspectError::Other {
            host: host.to_string(),
            reason: format!(
                "exit {code}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }),
        None => Err(InspectError::Other {
            host: host.to_string(),
            reason: "killed by signal".to_string(),
        }),
    }
}

/// One session per non-blank output line.
pub fn count_sessions(stdout: &str) -> u32 {
    stdout.lines().filter(|l| !l.trim().is_empty()).count() as u32
}

/// Counts sessions by running the configured listing command over ssh.
pub struct SshSessionInspector {
    runner: Arc<SshRunner>,
    command: String,
}

impl SshSessionInspector {
    pub fn new(runner: Arc<SshRunner>, command: &str) -> Self {
        Self {
            runner,
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl SessionInspector for SshSessionInspector {
    async fn sessions(&self, ip: &str, credential: &Credential) -> Result<u32, InspectError> {
        let stdout = self.runner.run(ip, credential, &self.command).await?;
        Ok(count_sessions(&stdout))
    }
}

/// Idle-logout and connection hooks run as remote commands.
///
/// A hook without a configured command does nothing.
pub struct CommandHooks {
    runner: Arc<SshRunner>,
    idle_logout: Option<String>,
    process_connections: Option<String>,
}

impl CommandHooks {
    pub fn new(
        runner: Arc<SshRunner>,
        idle_logout: Option<String>,
        process_connections: Option<String>,
    ) -> Self {
        Self {
            runner,
            idle_logout,
            process_connections,
        }
    }

    pub fn from_config(runner: Arc<SshRunner>, config: &DaemonConfig) -> Self {
        Self::new(
            runner,
            config.ssh.idle_logout_command.clone(),
            config.ssh.process_connections_command.clone(),
        )
    }
}

#[async_trait]
impl IdleSessionReaper for CommandHooks {
    async fn logout_idle_users(
        &self,
        cluster: &ClusterView,
        credential: &Credential,
    ) -> anyhow::Result<()> {
        let Some(command) = self.idle_logout.as_deref() else {
            return Ok(());
        };
        let mut failed = 0usize;
        for node in &cluster.active {
            let Some(ip) = node.ip.as_deref() else { continue };
            if let Err(e) = self.runner.run(ip, credential, command).await {
                warn!(app = %cluster.name(), instance = %node.instance_id, error = %e, "idle logout failed");
                failed += 1;
            }
        }
        if failed > 0 && failed == cluster.active.len() {
            bail!("idle logout failed on every active node of {}", cluster.name());
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionProcessor for CommandHooks {
    async fn process_connections(
        &self,
        node: &Instance,
        credential: &Credential,
    ) -> anyhow::Result<()> {
        let Some(command) = self.process_connections.as_deref() else {
            return Ok(());
        };
        let Some(ip) = node.ip.as_deref() else {
            bail!("instance {} has no address", node.instance_id);
        };
        self.runner.run(ip, credential, command).await?;
        Ok(())
    }
}
