//! Fleet driver backed by external commands.
//!
//! Each operation runs an operator-supplied program and reads JSON from its
//! stdout:
//!
//! - start: `VDIGRID_APP` and `VDIGRID_APP_ID` set in the environment,
//!   prints `{"instance_id": "..."}`.
//! - list: instance ids appended as arguments, prints
//!   `[{"instance_id": "...", "public_addresses": ["..."]}]`.
//! - terminate: instance ids appended as arguments, exit status only.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use vdigrid_autoscale::{DriverError, DriverResult, FleetDriver, NodeInfo};
use vdigrid_state::{Application, Instance};

use crate::config::DriverSection;

#[derive(Debug, Deserialize)]
struct Started {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
struct Listed {
    instance_id: String,
    #[serde(default)]
    public_addresses: Vec<String>,
}

pub struct CommandFleetDriver {
    start: Vec<String>,
    list: Vec<String>,
    terminate: Vec<String>,
    timeout: Duration,
}

impl CommandFleetDriver {
    pub fn new(section: &DriverSection) -> Self {
        Self {
            start: section.start_command.clone(),
            list: section.list_command.clone(),
            terminate: section.terminate_command.clone(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Run `argv` plus `extra` arguments and return stdout on success.
async fn invoke(
    argv: &[String],
    extra: &[String],
    env: &[(&str, &str)],
    timeout: Duration,
) -> Result<String, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "no command configured".to_string())?;

    let mut cmd = Command::new(program);
    cmd.args(args).args(extra).kill_on_drop(true);
    for (k, v) in env {
        cmd.env(k, v);
    }
    debug!(%program, extra = extra.len(), "running driver command");

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| format!("{program} timed out after {}s", timeout.as_secs()))?
        .map_err(|e| format!("{program}: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{program} exited with {}: {}", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl FleetDriver for CommandFleetDriver {
    async fn start_node(&self, app: &Application) -> DriverResult<String> {
        let env = [("VDIGRID_APP", app.name.as_str()), ("VDIGRID_APP_ID", app.id.as_str())];
        let stdout = invoke(&self.start, &[], &env, self.timeout)
            .await
            .map_err(DriverError::Start)?;
        let started: Started = serde_json::from_str(stdout.trim())
            .map_err(|e| DriverError::Start(format!("bad start output: {e}")))?;
        if started.instance_id.is_empty() {
            return Err(DriverError::Start("empty instance id".to_string()));
        }
        Ok(started.instance_id)
    }

    async fn list_instances(&self, instance_ids: &[String]) -> DriverResult<Vec<NodeInfo>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let stdout = invoke(&self.list, instance_ids, &[], self.timeout)
            .await
            .map_err(DriverError::List)?;
        let listed: Vec<Listed> = serde_json::from_str(stdout.trim())
            .map_err(|e| DriverError::List(format!("bad list output: {e}")))?;
        Ok(listed
            .into_iter()
            .map(|l| NodeInfo {
                instance_id: l.instance_id,
                public_addresses: l.public_addresses,
            })
            .collect())
    }

    async fn terminate_instances(&self, instances: &[Instance]) -> DriverResult<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = instances.iter().map(|i| i.instance_id.clone()).collect();
        invoke(&self.terminate, &ids, &[], self.timeout)
            .await
            .map_err(DriverError::Terminate)?;
        Ok(())
    }
}
