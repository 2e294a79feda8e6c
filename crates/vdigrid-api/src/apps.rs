//! Application upserts shared by the API and the offline CLI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vdigrid_state::{Application, RecordStore, StateError};

/// Body of a create-or-update request. The name doubles as the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRequest {
    pub name: String,
    pub users_per_small: u32,
    #[serde(default)]
    pub cluster_headroom: u32,
    #[serde(default = "default_interarrival")]
    pub scale_interarrival: u64,
    pub ssh_key: String,
}

fn default_interarrival() -> u64 {
    60
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    State(StateError),
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::InvalidApplicationId(_) => ApiError::Invalid(e.to_string()),
            other => ApiError::State(other),
        }
    }
}

/// Create or replace an application, keeping `created_at` of an existing
/// record. The next cycle becomes due immediately.
pub fn upsert_application(
    store: &dyn RecordStore,
    req: &ApplicationRequest,
    now: u64,
) -> Result<Application, ApiError> {
    Application::validate_id(&req.name)?;
    if req.users_per_small == 0 {
        return Err(ApiError::Invalid(
            "users_per_small must be greater than zero".to_string(),
        ));
    }
    if req.ssh_key.is_empty() {
        return Err(ApiError::Invalid("ssh_key must not be empty".to_string()));
    }

    let created_at = store
        .get_application(&req.name)?
        .map(|existing| existing.created_at)
        .unwrap_or(now);
    let app = Application {
        id: req.name.clone(),
        name: req.name.clone(),
        scale_interarrival: req.scale_interarrival,
        users_per_small: req.users_per_small,
        cluster_headroom: req.cluster_headroom,
        next_run_at: 0,
        ssh_key: req.ssh_key.clone(),
        created_at,
        updated_at: now,
    };
    store.put_application(&app)?;
    Ok(app)
}
