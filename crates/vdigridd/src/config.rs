//! vdigrid.toml configuration parser.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use vdigrid_autoscale::CycleSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub probe: ProbeSection,
    pub ssh: SshSection,
    pub driver: DriverSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub data_dir: PathBuf,
    /// Address the application API listens on.
    pub listen: String,
    pub tick_interval: String,
    pub max_backoff: String,
    /// How long terminated instance records are kept.
    pub terminated_retention: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub port: u16,
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub user: String,
    pub key_dir: PathBuf,
    pub connect_timeout: String,
    pub sessions_command: String,
    pub idle_logout_command: Option<String>,
    pub process_connections_command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub start_command: Vec<String>,
    pub list_command: Vec<String>,
    pub terminate_command: Vec<String>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/vdigrid"),
            listen: "127.0.0.1:8480".to_string(),
            tick_interval: "5s".to_string(),
            max_backoff: "10m".to_string(),
            terminated_retention: "24h".to_string(),
        }
    }
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            port: 22,
            timeout: "3s".to_string(),
        }
    }
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            key_dir: PathBuf::from("/etc/vdigrid/keys"),
            connect_timeout: "5s".to_string(),
            sessions_command: "who".to_string(),
            idle_logout_command: None,
            process_connections_command: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise use the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Check every duration field parses.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.tick_interval()?;
        self.max_backoff()?;
        self.terminated_retention()?;
        self.listen_addr()?;
        self.probe_timeout()?;
        self.ssh_connect_timeout()?;
        Ok(())
    }

    pub fn tick_interval(&self) -> anyhow::Result<Duration> {
        duration_field("daemon.tick_interval", &self.daemon.tick_interval)
    }

    pub fn max_backoff(&self) -> anyhow::Result<Duration> {
        duration_field("daemon.max_backoff", &self.daemon.max_backoff)
    }

    pub fn terminated_retention(&self) -> anyhow::Result<Duration> {
        duration_field("daemon.terminated_retention", &self.daemon.terminated_retention)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.daemon
            .listen
            .parse()
            .with_context(|| format!("daemon.listen: invalid address {:?}", self.daemon.listen))
    }

    /// Base URL the `apps` commands use to reach a running daemon.
    pub fn api_url(&self) -> String {
        format!("http://{}", self.daemon.listen)
    }

    pub fn probe_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("probe.timeout", &self.probe.timeout)
    }

    pub fn ssh_connect_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("ssh.connect_timeout", &self.ssh.connect_timeout)
    }

    pub fn db_path(&self) -> PathBuf {
        self.daemon.data_dir.join("vdigrid.redb")
    }

    pub fn cycle_settings(&self) -> anyhow::Result<CycleSettings> {
        Ok(CycleSettings {
            probe_port: self.probe.port,
            probe_timeout: self.probe_timeout()?,
            key_dir: self.ssh.key_dir.clone(),
            terminated_retention: self.terminated_retention()?,
        })
    }
}

fn duration_field(name: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("{name}: invalid duration {value:?}"))
}

/// Parse `<n><unit>` with unit `ms`, `s`, `m` or `h`; a bare number is
/// seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(n)),
        "" | "s" => Some(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.tick_interval().unwrap(), Duration::from_secs(5));
        assert_eq!(config.max_backoff().unwrap(), Duration::from_secs(600));
        assert_eq!(config.probe.port, 22);
        assert_eq!(config.ssh.sessions_command, "who");
        assert!(config.driver.start_command.is_empty());
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/vdigrid/vdigrid.redb"));
        assert_eq!(config.api_url(), "http://127.0.0.1:8480");
        assert_eq!(config.terminated_retention().unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[daemon]
data_dir = "/srv/vdigrid"
listen = "0.0.0.0:9000"
tick_interval = "2s"
max_backoff = "5m"
terminated_retention = "1h"

[probe]
port = 3389
timeout = "1500ms"

[ssh]
user = "admin"
key_dir = "/srv/keys"
connect_timeout = "4s"
sessions_command = "loginctl list-sessions --no-legend"
idle_logout_command = "/usr/local/bin/logout-idle"

[driver]
start_command = ["/usr/local/bin/fleet", "start"]
list_command = ["/usr/local/bin/fleet", "list"]
terminate_command = ["/usr/local/bin/fleet", "terminate"]
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        let settings = config.cycle_settings().unwrap();
        assert_eq!(settings.probe_port, 3389);
        assert_eq!(settings.probe_timeout, Duration::from_millis(1500));
        assert_eq!(settings.key_dir, PathBuf::from("/srv/keys"));
        assert_eq!(settings.terminated_retention, Duration::from_secs(3600));
        assert_eq!(config.listen_addr().unwrap().port(), 9000);
        assert_eq!(config.ssh.user, "admin");
        assert_eq!(
            config.ssh.idle_logout_command.as_deref(),
            Some("/usr/local/bin/logout-idle")
        );
        assert_eq!(config.ssh.process_connections_command, None);
        assert_eq!(config.driver.list_command, vec!["/usr/local/bin/fleet", "list"]);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: DaemonConfig = toml::from_str("[probe]\nport = 2222\n").unwrap();
        assert_eq!(config.probe.port, 2222);
        assert_eq!(config.probe_timeout().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn bad_duration_fails_validation() {
        let config: DaemonConfig = toml::from_str("[daemon]\ntick_interval = \"soon\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdigrid.toml");
        std::fs::write(&path, "[ssh]\nuser = \"desk\"\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.ssh.user, "desk");
        assert!(DaemonConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("m"), None);
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let huge = format!("{}m", u64::MAX);
        assert_eq!(parse_duration(&huge), None);
        assert_eq!(parse_duration(&format!("{}h", u64::MAX / 60)), None);

        let config: DaemonConfig =
            toml::from_str(&format!("[daemon]\nmax_backoff = \"{huge}\"\n")).unwrap();
        assert!(config.validate().is_err());
    }
}
