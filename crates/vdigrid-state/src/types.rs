//! Record types for the vdigrid record store.
//!
//! These types represent the persisted state of application clusters and
//! their compute nodes. All types are serializable to/from JSON for storage
//! in redb tables.

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for an application cluster.
pub type ApplicationId = String;

/// Opaque identifier assigned to a node by the fleet driver.
pub type InstanceId = String;

// ── Application ───────────────────────────────────────────────────

/// One managed virtual-desktop application cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: ApplicationId,
    pub name: String,
    /// Seconds between scale cycles.
    pub scale_interarrival: u64,
    /// Sessions one standard-sized node can serve.
    pub users_per_small: u32,
    /// Spare capacity (in sessions) the cluster must keep available.
    pub cluster_headroom: u32,
    /// Unix timestamp (seconds) at which the next cycle becomes due.
    pub next_run_at: u64,
    /// Key file name, resolved against the configured key directory.
    pub ssh_key: String,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this record was last updated.
    pub updated_at: u64,
}

impl Application {
    /// Build the key for the applications table.
    pub fn table_key(&self) -> String {
        self.id.clone()
    }

    /// Reject ids that would collide in the instances table key space.
    pub fn validate_id(id: &str) -> StateResult<()> {
        if id.is_empty() || id.contains(':') {
            return Err(StateError::InvalidApplicationId(id.to_string()));
        }
        Ok(())
    }

    /// Whether a cycle is due at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        self.next_run_at <= now
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a compute node.
///
/// States only ever move forward, one step at a time:
/// `Booting → Active → ShuttingDown → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Booting,
    Active,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    /// Position along the lifecycle.
    pub fn rank(self) -> u8 {
        match self {
            InstanceState::Booting => 1,
            InstanceState::Active => 2,
            InstanceState::ShuttingDown => 3,
            InstanceState::Terminated => 4,
        }
    }

    /// Whether `next` is the immediate successor of this state.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        next.rank() == self.rank() + 1
    }
}

/// One compute node belonging to one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub instance_id: InstanceId,
    pub application_id: ApplicationId,
    /// Resolved address, recorded once when the node becomes reachable.
    pub ip: Option<String>,
    pub state: InstanceState,
    /// Unix timestamp (seconds) when the node was found drained and
    /// handed to the driver for termination.
    pub shutdown_requested_at: Option<u64>,
    /// Unix timestamp (milliseconds) when the node joined the cluster.
    /// Orders the waterfall, oldest first.
    pub added_at: u64,
    /// Unix timestamp (seconds) of last change.
    pub updated_at: u64,
}

impl Instance {
    /// A freshly launched node, as reported by the fleet driver.
    pub fn booting(
        application_id: &str,
        instance_id: &str,
        added_at: u64,
        now: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            application_id: application_id.to_string(),
            ip: None,
            state: InstanceState::Booting,
            shutdown_requested_at: None,
            added_at,
            updated_at: now,
        }
    }

    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.application_id, self.instance_id)
    }

    /// Move to the next lifecycle state.
    pub fn transition(&mut self, next: InstanceState, now: u64) -> StateResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                instance_id: self.instance_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Booting → Active, recording the address the node answered on.
    pub fn activate(&mut self, ip: &str, now: u64) -> StateResult<()> {
        if self.ip.is_some() {
            return Err(StateError::AddressAlreadySet(self.instance_id.clone()));
        }
        self.transition(InstanceState::Active, now)?;
        self.ip = Some(ip.to_string());
        Ok(())
    }

    /// Stamp the drain time. Returns false if it was already stamped.
    pub fn request_shutdown(&mut self, now: u64) -> bool {
        if self.shutdown_requested_at.is_some() {
            return false;
        }
        self.shutdown_requested_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Waterfall ordering key.
    pub fn waterfall_key(&self) -> (u64, &str) {
        (self.added_at, self.instance_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst() -> Instance {
        Instance::booting("app-1", "i-1", 1_000, 1)
    }

    #[test]
    fn forward_transitions_are_accepted() {
        let mut i = inst();
        i.activate("10.0.0.5", 2).unwrap();
        assert_eq!(i.state, InstanceState::Active);
        assert_eq!(i.ip.as_deref(), Some("10.0.0.5"));

        i.transition(InstanceState::ShuttingDown, 3).unwrap();
        i.transition(InstanceState::Terminated, 4).unwrap();
        assert_eq!(i.state, InstanceState::Terminated);
        assert_eq!(i.updated_at, 4);
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let mut i = inst();
        let err = i.transition(InstanceState::ShuttingDown, 2).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(i.state, InstanceState::Booting);
    }

    #[test]
    fn backward_transition_is_rejected() {
        let mut i = inst();
        i.activate("10.0.0.5", 2).unwrap();
        assert!(i.transition(InstanceState::Booting, 3).is_err());
        assert!(i.transition(InstanceState::Active, 3).is_err());
    }

    #[test]
    fn address_is_recorded_once() {
        let mut i = inst();
        i.ip = Some("10.0.0.1".to_string());
        assert!(matches!(
            i.activate("10.0.0.2", 2),
            Err(StateError::AddressAlreadySet(_))
        ));
        assert_eq!(i.state, InstanceState::Booting);
    }

    #[test]
    fn application_ids_reject_key_separator() {
        assert!(Application::validate_id("office").is_ok());
        assert!(Application::validate_id("office-east_2").is_ok());
        assert!(Application::validate_id("office:east").is_err());
        assert!(Application::validate_id("").is_err());
    }

    #[test]
    fn shutdown_stamp_is_set_once() {
        let mut i = inst();
        assert!(i.request_shutdown(10));
        assert!(!i.request_shutdown(20));
        assert_eq!(i.shutdown_requested_at, Some(10));
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let json = serde_json::to_string(&InstanceState::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting_down\"");
    }

    #[test]
    fn due_check_includes_exact_time() {
        let app = Application {
            id: "a".to_string(),
            name: "a".to_string(),
            scale_interarrival: 30,
            users_per_small: 4,
            cluster_headroom: 8,
            next_run_at: 100,
            ssh_key: "a.pem".to_string(),
            created_at: 0,
            updated_at: 0,
        };
        assert!(app.is_due(100));
        assert!(app.is_due(101));
        assert!(!app.is_due(99));
    }
}
