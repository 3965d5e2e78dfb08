pub mod backend;
pub mod config;
pub mod controller;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod http;
pub mod mirror;
pub mod pipeline;
pub mod registry;
pub mod supervisor;

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;

use crate::supervisor::Supervisor;

/// Mounts the Control API (§4.H): `POST /runs/:id/start`, `POST
/// /runs/:id/stop`, `GET /pilots/live`, plus the teacher's `/healthz`/
/// `/readyz` pair for orchestration-layer liveness checks.
pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/runs/:run_id/start", post(http::control::start_run))
        .route("/runs/:run_id/stop", post(http::control::stop_run))
        .route("/pilots/live", get(http::control::pilots_live))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(supervisor)
}

mod health {
    use super::{IntoResponse, State};
    use std::sync::Arc;

    use crate::supervisor::Supervisor;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    /// Ready once the gateway has a listen port bound; there is no database
    /// connection pool to probe here (§9: no local DB, per Non-goals).
    pub async fn readyz(State(_supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
        "ok"
    }
}
