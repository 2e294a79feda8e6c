//! vdigridd — the vdigrid autoscaling daemon.
//!
//! Assembles the record store, the reachability probe, the ssh session
//! inspector, the command-backed fleet driver and the per-application
//! scale cycle, then drives everything from the trigger loop. The running
//! daemon holds the store's file lock, so `apps` commands go through its
//! HTTP API unless `--offline` is given.
//!
//! # Usage
//!
//! ```text
//! vdigridd --config /etc/vdigrid/vdigrid.toml run
//! vdigridd apps put --name office --users-per-small 4 --headroom 8 --interarrival 60 --ssh-key office.pem
//! vdigridd apps list
//! vdigridd apps --offline --data-dir /srv/vdigrid list
//! ```

mod client;
mod command_driver;
mod config;
mod ssh;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, info_span, warn};

use vdigrid_autoscale::{ScaleCycle, Trigger};
use vdigrid_probe::NetProbe;
use vdigrid_api::{ApplicationRequest, upsert_application};
use vdigrid_state::{RecordStore, StateError, StateStore};

use crate::client::DaemonClient;
use crate::command_driver::CommandFleetDriver;
use crate::config::DaemonConfig;
use crate::ssh::{CommandHooks, SshRunner, SshSessionInspector};

#[derive(Parser)]
#[command(name = "vdigridd", about = "vdigrid autoscaling daemon")]
struct Cli {
    /// Path to vdigrid.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trigger loop until interrupted.
    Run {
        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Manage application records.
    Apps {
        /// Daemon API base URL (defaults to `http://<daemon.listen>`).
        #[arg(long, global = true)]
        server: Option<String>,

        /// Open the store directly instead of going through the daemon.
        /// Fails while the daemon is running.
        #[arg(long, global = true)]
        offline: bool,

        /// Override the configured data directory (with --offline).
        #[arg(long, global = true)]
        data_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: AppsAction,
    },
}

#[derive(Subcommand)]
enum AppsAction {
    /// List configured applications.
    List,
    /// Create or update an application.
    Put(PutArgs),
    /// Remove an application record.
    Remove {
        #[arg(long)]
        name: String,
    },
}

#[derive(Args)]
struct PutArgs {
    #[arg(long)]
    name: String,

    /// Sessions one node can serve.
    #[arg(long)]
    users_per_small: u32,

    /// Spare sessions to keep available.
    #[arg(long, default_value = "0")]
    headroom: u32,

    /// Seconds between scale cycles.
    #[arg(long, default_value = "60")]
    interarrival: u64,

    /// Key file name under the ssh key directory.
    #[arg(long)]
    ssh_key: String,
}

impl From<PutArgs> for ApplicationRequest {
    fn from(args: PutArgs) -> Self {
        Self {
            name: args.name,
            users_per_small: args.users_per_small,
            cluster_headroom: args.headroom,
            scale_interarrival: args.interarrival,
            ssh_key: args.ssh_key,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { data_dir } => {
            if let Some(dir) = data_dir {
                config.daemon.data_dir = dir;
            }
            run_daemon(config).await
        }
        Command::Apps {
            server,
            offline,
            data_dir,
            action,
        } => {
            if let Some(dir) = data_dir {
                config.daemon.data_dir = dir;
            }
            if offline {
                let store = open_offline_store(&config)?;
                apps_offline(&store, action)
            } else {
                let url = server.unwrap_or_else(|| config.api_url());
                apps_remote(&DaemonClient::new(&url)?, action).await
            }
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vdigridd=debug,vdigrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
        format!("creating data dir {}", config.daemon.data_dir.display())
    })?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

/// Open the store for `apps --offline`, explaining a lock held by the daemon.
fn open_offline_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    match open_store(config) {
        Err(e) => match e.downcast::<StateError>() {
            Ok(StateError::Locked(path)) => Err(anyhow::anyhow!(
                "{path} is held by a running vdigridd; drop --offline to manage applications through its API"
            )),
            Ok(other) => Err(other.into()),
            Err(e) => Err(e),
        },
        ok => ok,
    }
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    info!("vdigrid daemon starting");

    let store: Arc<dyn RecordStore> = Arc::new(open_store(&config)?);

    let probe = Arc::new(NetProbe::new(config.probe_timeout()?));
    let runner = Arc::new(SshRunner::new(&config.ssh.user, config.ssh_connect_timeout()?));
    let inspector = Arc::new(SshSessionInspector::new(
        runner.clone(),
        &config.ssh.sessions_command,
    ));
    let hooks = Arc::new(CommandHooks::from_config(runner, &config));
    let driver = Arc::new(CommandFleetDriver::new(&config.driver));
    info!(
        probe_port = config.probe.port,
        ssh_user = %config.ssh.user,
        "collaborators initialized"
    );

    let cycle = ScaleCycle::new(
        store.clone(),
        driver,
        probe,
        inspector,
        config.cycle_settings()?,
    )
    .with_hooks(hooks.clone(), hooks)
    .with_span(info_span!("vdigridd"));

    let router = vdigrid_api::build_router(store.clone());
    let trigger = Trigger::new(store, Arc::new(cycle))
        .with_tick_interval(config.tick_interval()?)
        .with_max_backoff(config.max_backoff()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger_handle = tokio::spawn(async move {
        trigger.run(shutdown_rx).await;
    });

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding API listener on {addr}"))?;
    info!(%addr, "application API listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed");
            }
            info!("shutdown signal received");
        })
        .await;
    let _ = shutdown_tx.send(true);

    // The trigger drains in-flight cycles before returning.
    let _ = trigger_handle.await;
    served.context("API server failed")?;
    info!("vdigrid daemon stopped");
    Ok(())
}

async fn apps_remote(client: &DaemonClient, action: AppsAction) -> anyhow::Result<()> {
    match action {
        AppsAction::List => {
            let apps = client.list_applications().await?;
            println!("{}", serde_json::to_string_pretty(&apps)?);
        }
        AppsAction::Put(args) => {
            let app = client.put_application(&args.into()).await?;
            println!("Saved application {}", app.name);
        }
        AppsAction::Remove { name } => {
            client.remove_application(&name).await?;
            println!("Removed application {name}");
        }
    }
    Ok(())
}

fn apps_offline(store: &dyn RecordStore, action: AppsAction) -> anyhow::Result<()> {
    match action {
        AppsAction::List => {
            let apps = store.list_applications()?;
            println!("{}", serde_json::to_string_pretty(&apps)?);
        }
        AppsAction::Put(args) => {
            let app = upsert_application(store, &args.into(), epoch_secs())?;
            println!("Saved application {}", app.name);
        }
        AppsAction::Remove { name } => {
            if store.delete_application(&name)? {
                println!("Removed application {name}");
            } else {
                anyhow::bail!("no application named {name}");
            }
        }
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_store_explains_running_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.daemon.data_dir = dir.path().to_path_buf();

        let held = open_store(&config).unwrap();
        let err = open_offline_store(&config).err().unwrap();
        assert!(err.to_string().contains("drop --offline"));

        drop(held);
        assert!(open_offline_store(&config).is_ok());
    }

    #[test]
    fn put_args_map_to_request() {
        let cli = Cli::parse_from([
            "vdigridd", "apps", "put", "--name", "office", "--users-per-small", "4",
            "--ssh-key", "office.pem",
        ]);
        let Command::Apps {
            action: AppsAction::Put(args),
            offline,
            ..
        } = cli.command
        else {
            panic!("expected apps put");
        };
        assert!(!offline);
        let req = ApplicationRequest::from(args);
        assert_eq!(req.cluster_headroom, 0);
        assert_eq!(req.scale_interarrival, 60);
    }
}
