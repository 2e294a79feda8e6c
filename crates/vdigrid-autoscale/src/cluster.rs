//! ClusterView — a point-in-time snapshot of one application's fleet.
//!
//! Buckets the application's instances by lifecycle state in waterfall
//! order and, once measured, carries the live session count of every
//! active node. Headroom figures are derived from the snapshot only; the
//! store is not re-read until a new view is loaded.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use vdigrid_state::{Application, Instance, InstanceState, RecordStore};

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::fleet::{Credential, FleetDriver, InspectError, SessionInspector};

/// Snapshot of one application cluster.
#[derive(Debug, Clone)]
pub struct ClusterView {
    app: Application,
    pub booting: Vec<Instance>,
    pub active: Vec<Instance>,
    pub shutting_down: Vec<Instance>,
    /// `(node, live sessions)` for every active node whose count could be
    /// verified, in waterfall order.
    pub inuse_map: Vec<(Instance, u32)>,
}

impl ClusterView {
    /// Read the application's instances and bucket them by state.
    ///
    /// No session counts are gathered; see [`ClusterView::measure`].
    pub fn load(store: &dyn RecordStore, app: &Application) -> AutoscaleResult<Self> {
        let mut instances = store.list_instances_for_application(&app.id)?;
        instances.sort_by(|a, b| a.waterfall_key().cmp(&b.waterfall_key()));

        let mut view = Self {
            app: app.clone(),
            booting: Vec::new(),
            active: Vec::new(),
            shutting_down: Vec::new(),
            inuse_map: Vec::new(),
        };
        for inst in instances {
            match inst.state {
                InstanceState::Booting => view.booting.push(inst),
                InstanceState::Active => view.active.push(inst),
                InstanceState::ShuttingDown => view.shutting_down.push(inst),
                InstanceState::Terminated => {}
            }
        }
        Ok(view)
    }

    /// Load the view and measure session usage on the active nodes.
    pub async fn snapshot(
        store: &dyn RecordStore,
        inspector: &dyn SessionInspector,
        app: &Application,
        credential: &Credential,
    ) -> AutoscaleResult<Self> {
        let mut view = Self::load(store, app)?;
        view.measure(inspector, credential).await;
        Ok(view)
    }

    /// Query the live session count of every active node.
    ///
    /// Nodes that cannot be queried are left out of `inuse_map` and count
    /// as fully consumed.
    pub async fn measure(&mut self, inspector: &dyn SessionInspector, credential: &Credential) {
        self.inuse_map.clear();
        for node in &self.active {
            let Some(ip) = node.ip.as_deref() else {
                warn!(instance = %node.instance_id, "active node has no address recorded");
                continue;
            };
            match inspector.sessions(ip, credential).await {
                Ok(count) => self.inuse_map.push((node.clone(), count)),
                Err(InspectError::NotConnectable(_)) => {
                    warn!(instance = %node.instance_id, %ip, "active node is not connectable");
                }
                Err(e) => {
                    warn!(instance = %node.instance_id, %ip, error = %e, "session count unavailable");
                }
            }
        }
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub fn name(&self) -> &str {
        &self.app.name
    }

    /// Sessions' worth of capacity already spoken for.
    pub fn consumed(&self) -> i64 {
        let per_node = i64::from(self.app.users_per_small);
        let sessions: i64 = self.inuse_map.iter().map(|(_, n)| i64::from(*n)).sum();
        let unverified = (self.active.len() - self.inuse_map.len()) as i64;
        sessions + unverified * per_node
    }

    /// Spare capacity: active and booting nodes, less consumed sessions.
    pub fn avail_headroom(&self) -> i64 {
        let per_node = i64::from(self.app.users_per_small);
        let nodes = (self.active.len() + self.booting.len()) as i64;
        nodes * per_node - self.consumed()
    }

    /// Spare capacity the application asks for.
    pub fn req_headroom(&self) -> i64 {
        i64::from(self.app.cluster_headroom)
    }

    /// Launch one node and record it as booting.
    ///
    /// Nothing is persisted if the driver rejects the request.
    pub async fn start_node(
        &self,
        driver: &dyn FleetDriver,
        store: &dyn RecordStore,
        now: u64,
    ) -> AutoscaleResult<Instance> {
        let instance_id = driver.start_node(&self.app).await?;
        let instance = Instance::booting(&self.app.id, &instance_id, epoch_millis(), now);
        store.put_instance(&instance)?;
        info!(app = %self.app.name, instance = %instance_id, "node started");
        Ok(instance)
    }

    /// Whether the application's configuration allows headroom arithmetic.
    pub fn validate(app: &Application) -> AutoscaleResult<()> {
        if app.users_per_small == 0 {
            return Err(AutoscaleError::InvalidConfig {
                app: app.name.clone(),
                reason: "users_per_small must be greater than zero".to_string(),
            });
        }
        debug!(app = %app.name, users_per_small = app.users_per_small, "configuration ok");
        Ok(())
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
