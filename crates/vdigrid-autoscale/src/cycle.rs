//! ScaleCycle — one reconciliation pass over one application cluster.
//!
//! Steps, strictly in order:
//!
//! ```text
//! 1. idle cleanup          reaper.logout_idle_users(view)
//! 2. connection upkeep     connections.process_connections(node)   per active node
//! 3. boot detection        driver.list_instances → resolve → probe → Booting→Active
//! 4. scale up              avail < req  ⇒  start ceil((req-avail)/users_per_small) nodes
//! 5. graceful shutdown     sessions == 0 on a draining node ⇒ terminate batch
//! 6. scale down            idle nodes, newest first, while surplus covers a node
//! ```
//!
//! Booting records the driver's listing no longer contains are dropped in
//! step 3, so a launch that failed after being accepted stops hiding a
//! shortfall. Terminated records past their retention are pruned last.
//!
//! Per-node failures in steps 3 and 5 are logged and skipped. Store errors
//! and configuration errors abort the cycle.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use vdigrid_probe::{Address, Reachability};
use vdigrid_state::{Application, Instance, InstanceState, RecordStore};

use crate::cluster::ClusterView;
use crate::error::{AutoscaleError, AutoscaleResult};
use crate::fleet::{
    ConnectionProcessor, Credential, FleetDriver, IdleSessionReaper, InspectError, NodeInfo,
    NoopHooks, SessionInspector,
};
use crate::headroom::{select_for_shutdown, servers_needed};

/// Tunables shared by every cycle.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    /// Management port probed on booting nodes.
    pub probe_port: u16,
    /// Bound on a single connect probe.
    pub probe_timeout: Duration,
    /// Directory that application key references are resolved against.
    pub key_dir: PathBuf,
    /// How long terminated records are kept before they are pruned.
    pub terminated_retention: Duration,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            probe_port: 22,
            probe_timeout: Duration::from_secs(3),
            key_dir: PathBuf::from("/etc/vdigrid/keys"),
            terminated_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub application: String,
    pub activated: u32,
    pub still_booting: u32,
    pub started: u32,
    pub failed_starts: u32,
    pub terminated: u32,
    /// Booting records dropped because the driver stopped reporting them.
    pub retired: u32,
    pub unreachable: u32,
    pub marked_for_shutdown: u32,
}

impl CycleReport {
    /// Whether the cycle changed any instance state or launched anything.
    pub fn is_quiet(&self) -> bool {
        self.activated == 0
            && self.started == 0
            && self.terminated == 0
            && self.retired == 0
            && self.marked_for_shutdown == 0
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} activated, {} booting, {} started ({} failed), {} terminated, \
             {} retired, {} unreachable, {} draining",
            self.application,
            self.activated,
            self.still_booting,
            self.started,
            self.failed_starts,
            self.terminated,
            self.retired,
            self.unreachable,
            self.marked_for_shutdown,
        )
    }
}

/// A unit of work the trigger schedules once per due application.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Run the job for `app` at `now` (unix seconds), returning a summary.
    async fn execute(&self, app: &Application, now: u64) -> AutoscaleResult<String>;
}

/// The per-application reconciliation routine.
pub struct ScaleCycle {
    store: Arc<dyn RecordStore>,
    driver: Arc<dyn FleetDriver>,
    probe: Arc<dyn Reachability>,
    inspector: Arc<dyn SessionInspector>,
    reaper: Arc<dyn IdleSessionReaper>,
    connections: Arc<dyn ConnectionProcessor>,
    settings: CycleSettings,
    /// Parent span for every cycle's span.
    span: Span,
}

impl ScaleCycle {
    /// Create a cycle with no-op idle and connection hooks.
    pub fn new(
        store: Arc<dyn RecordStore>,
        driver: Arc<dyn FleetDriver>,
        probe: Arc<dyn Reachability>,
        inspector: Arc<dyn SessionInspector>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            store,
            driver,
            probe,
            inspector,
            reaper: Arc::new(NoopHooks),
            connections: Arc::new(NoopHooks),
            settings,
            span: Span::none(),
        }
    }

    /// Set the idle-session and per-node connection hooks.
    pub fn with_hooks(
        mut self,
        reaper: Arc<dyn IdleSessionReaper>,
        connections: Arc<dyn ConnectionProcessor>,
    ) -> Self {
        self.reaper = reaper;
        self.connections = connections;
        self
    }

    /// Set the span every cycle's span is parented to.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run one cycle for `app` using the wall clock.
    pub async fn run(&self, app: &Application) -> AutoscaleResult<CycleReport> {
        self.run_at(app, epoch_secs()).await
    }

    /// Run one cycle for `app` at time `now` (unix seconds).
    pub async fn run_at(&self, app: &Application, now: u64) -> AutoscaleResult<CycleReport> {
        let span = info_span!(parent: &self.span, "scale_cycle", app = %app.name);
        self.reconcile(app, now).instrument(span).await
    }

    async fn reconcile(&self, app: &Application, now: u64) -> AutoscaleResult<CycleReport> {
        ClusterView::validate(app)?;
        let credential = Credential::for_application(&self.settings.key_dir, app);
        let mut report = CycleReport {
            application: app.name.clone(),
            ..CycleReport::default()
        };

        let view = ClusterView::load(self.store.as_ref(), app)?;

        // 1. Idle cleanup.
        if let Err(e) = self.reaper.logout_idle_users(&view, &credential).await {
            warn!(error = %e, "idle session cleanup failed");
        }

        // 2. Connection upkeep.
        for node in &view.active {
            if let Err(e) = self.connections.process_connections(node, &credential).await {
                warn!(instance = %node.instance_id, error = %e, "connection processing failed");
            }
        }

        // 3. Boot detection.
        self.detect_booted(view.booting, now, &mut report).await?;

        // 4. Scale up.
        let view = ClusterView::snapshot(
            self.store.as_ref(),
            self.inspector.as_ref(),
            app,
            &credential,
        )
        .await?;
        self.scale_up(&view, now, &mut report).await?;

        // 5. Graceful shutdown.
        self.drain_shutting_down(&view.shutting_down, &credential, now, &mut report)
            .await?;

        // 6. Scale down.
        let view = ClusterView::snapshot(
            self.store.as_ref(),
            self.inspector.as_ref(),
            app,
            &credential,
        )
        .await?;
        self.scale_down(&view, now, &mut report)?;

        let cutoff = now.saturating_sub(self.settings.terminated_retention.as_secs());
        let pruned = self.store.prune_terminated(&app.id, cutoff)?;
        if pruned > 0 {
            debug!(pruned, "old terminated records removed");
        }

        info!(summary = %report, "scale cycle complete");
        Ok(report)
    }

    async fn detect_booted(
        &self,
        booting: Vec<Instance>,
        now: u64,
        report: &mut CycleReport,
    ) -> AutoscaleResult<()> {
        if booting.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = booting.iter().map(|i| i.instance_id.clone()).collect();
        let listed = match self.driver.list_instances(&ids).await {
            Ok(nodes) => Some(nodes),
            Err(e) => {
                warn!(error = %e, "could not list booting nodes");
                None
            }
        };

        let mut waiting = 0u32;
        for mut instance in booting {
            let info = match &listed {
                Some(nodes) => {
                    let found = nodes.iter().find(|n| n.instance_id == instance.instance_id);
                    if found.is_none() {
                        self.retire_unlisted(&instance, report)?;
                        continue;
                    }
                    found
                }
                None => None,
            };

            let Some(ip) = self.reachable_address(info).await else {
                waiting += 1;
                continue;
            };
            if let Err(e) = instance.activate(&ip.to_string(), now) {
                warn!(instance = %instance.instance_id, error = %e, "cannot activate node");
                waiting += 1;
                continue;
            }
            self.store.put_instance(&instance)?;
            report.activated += 1;
            debug!(instance = %instance.instance_id, %ip, "node is active");
        }

        report.still_booting = waiting;
        if waiting > 0 {
            debug!(waiting, "still waiting for nodes to boot");
        }
        Ok(())
    }

    /// Drop a booting record the driver no longer knows about.
    ///
    /// The launch behind it never materialized, so it must stop counting
    /// as pending capacity.
    fn retire_unlisted(
        &self,
        instance: &Instance,
        report: &mut CycleReport,
    ) -> AutoscaleResult<()> {
        self.store
            .delete_instance(&instance.application_id, &instance.instance_id)?;
        report.retired += 1;
        warn!(
            instance = %instance.instance_id,
            "booting node is not reported by the fleet driver, dropping it"
        );
        Ok(())
    }

    /// The address a booting node answers on, if it answers yet.
    async fn reachable_address(&self, info: Option<&NodeInfo>) -> Option<IpAddr> {
        let info = info?;
        let Some(raw) = info.public_addresses.first() else {
            debug!(instance = %info.instance_id, "no address assigned yet");
            return None;
        };

        let ip = match Address::parse(raw) {
            Address::Ip(ip) => ip,
            Address::Name(host) => match self.probe.resolve(&host).await {
                Ok(ip) => ip,
                Err(e) => {
                    debug!(instance = %info.instance_id, %host, error = %e, "not resolvable yet");
                    return None;
                }
            },
        };

        let result = self
            .probe
            .probe(ip, self.settings.probe_port, self.settings.probe_timeout)
            .await;
        if !result.is_reachable() {
            debug!(instance = %info.instance_id, %ip, ?result, "node is not yet available");
            return None;
        }
        Some(ip)
    }

    async fn scale_up(
        &self,
        view: &ClusterView,
        now: u64,
        report: &mut CycleReport,
    ) -> AutoscaleResult<()> {
        let avail = view.avail_headroom();
        let req = view.req_headroom();
        debug!(avail, req, "considering scale up");
        if avail >= req {
            return Ok(());
        }

        let needed = servers_needed(req - avail, view.app().users_per_small);
        info!(avail, req, needed, "headroom short, starting nodes");
        for _ in 0..needed {
            match view
                .start_node(self.driver.as_ref(), self.store.as_ref(), now)
                .await
            {
                Ok(_) => report.started += 1,
                Err(AutoscaleError::Driver(e)) => {
                    error!(error = %e, "node start failed");
                    report.failed_starts += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn drain_shutting_down(
        &self,
        shutting_down: &[Instance],
        credential: &Credential,
        now: u64,
        report: &mut CycleReport,
    ) -> AutoscaleResult<()> {
        let mut to_terminate = Vec::new();

        for host in shutting_down {
            let Some(ip) = host.ip.as_deref() else {
                warn!(instance = %host.instance_id, "draining node has no address, skipping");
                report.unreachable += 1;
                continue;
            };

            match self.inspector.sessions(ip, credential).await {
                Ok(0) => {
                    let mut host = host.clone();
                    if host.request_shutdown(now) {
                        self.store.put_instance(&host)?;
                    }
                    to_terminate.push(host);
                }
                Ok(sessions) => {
                    debug!(instance = %host.instance_id, %ip, sessions, "waiting for sessions to end");
                }
                Err(InspectError::NotConnectable(_)) => {
                    warn!(
                        instance = %host.instance_id,
                        %ip,
                        "node waiting to shut down is not connectable and should be looked into"
                    );
                    report.unreachable += 1;
                }
                Err(e) => {
                    warn!(
                        instance = %host.instance_id,
                        %ip,
                        error = %e,
                        "cannot verify sessions, skipping"
                    );
                    report.unreachable += 1;
                }
            }
        }

        if to_terminate.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.driver.terminate_instances(&to_terminate).await {
            error!(count = to_terminate.len(), error = %e, "terminate request failed");
            return Ok(());
        }

        for mut host in to_terminate {
            if let Err(e) = host.transition(InstanceState::Terminated, now) {
                warn!(instance = %host.instance_id, error = %e, "cannot mark node terminated");
                continue;
            }
            self.store.put_instance(&host)?;
            report.terminated += 1;
            info!(instance = %host.instance_id, "node terminated");
        }
        Ok(())
    }

    fn scale_down(
        &self,
        view: &ClusterView,
        now: u64,
        report: &mut CycleReport,
    ) -> AutoscaleResult<()> {
        let overprov = view.avail_headroom() - view.req_headroom();
        debug!(
            overprov,
            avail = view.avail_headroom(),
            req = view.req_headroom(),
            "considering scale down"
        );

        for node in select_for_shutdown(&view.inuse_map, overprov, view.app().users_per_small) {
            let mut node = node.clone();
            if let Err(e) = node.transition(InstanceState::ShuttingDown, now) {
                warn!(instance = %node.instance_id, error = %e, "cannot drain node");
                continue;
            }
            self.store.put_instance(&node)?;
            report.marked_for_shutdown += 1;
            info!(
                instance = %node.instance_id,
                ip = node.ip.as_deref().unwrap_or("-"),
                "node has no sessions, removing it from the cluster"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for ScaleCycle {
    async fn execute(&self, app: &Application, now: u64) -> AutoscaleResult<String> {
        self.run_at(app, now).await.map(|report| report.to_string())
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
