//! Autoscaler error types.

use thiserror::Error;

use crate::fleet::DriverError;

/// Errors that abort a scale cycle or a trigger tick.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("invalid configuration for application {app}: {reason}")]
    InvalidConfig { app: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] vdigrid_state::StateError),

    #[error("fleet driver error: {0}")]
    Driver(#[from] DriverError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
