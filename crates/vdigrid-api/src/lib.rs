//! vdigrid-api — REST API for vdigrid.
//!
//! The daemon owns the record store; operators change applications through
//! these routes while the autoscaler keeps running.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/applications` | List applications |
//! | POST | `/api/v1/applications` | Create or update an application |
//! | GET | `/api/v1/applications/{id}` | Get one application |
//! | DELETE | `/api/v1/applications/{id}` | Delete an application |
//! | GET | `/api/v1/applications/{id}/instances` | List an application's instances |

pub mod apps;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use vdigrid_state::RecordStore;

pub use apps::{ApiError, ApplicationRequest, upsert_application};
pub use handlers::ApiResponse;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn RecordStore>,
}

/// Build the API router.
pub fn build_router(store: Arc<dyn RecordStore>) -> Router {
    let state = ApiState { store };

    let api_routes = Router::new()
        .route(
            "/applications",
            get(handlers::list_applications).post(handlers::put_application),
        )
        .route(
            "/applications/{id}",
            get(handlers::get_application).delete(handlers::delete_application),
        )
        .route("/applications/{id}/instances", get(handlers::list_instances))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
