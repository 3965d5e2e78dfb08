//! Control API (§4.H): the only externally reachable surface. Generalizes
//! the original's `api.py` (three FastAPI routes backed directly by
//! `OrchestratorStation`/`OrchestratorState`) into `axum` handlers over
//! `Supervisor`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::errors::ControlApiError;
use crate::supervisor::Supervisor;

pub async fn start_run(
    State(supervisor): State<Arc<Supervisor>>,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ControlApiError> {
    supervisor.controller.start_run(run_id).await?;
    Ok(Json(json!({ "ok": true, "run_id": run_id })))
}

pub async fn stop_run(
    State(supervisor): State<Arc<Supervisor>>,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ControlApiError> {
    supervisor.controller.stop_run(run_id).await?;
    Ok(Json(json!({ "ok": true, "run_id": run_id })))
}

/// Reads from the in-memory [`crate::registry::PilotRegistry`] snapshot
/// rather than re-reading the KV mirror (`api.py`'s `GET /pilots/live` uses
/// a Redis `scan_iter`): the mirror is write-only from the orchestrator's
/// perspective (§3 Ownership), so treating it as a read path here would
/// contradict that framing. The registry is already the authoritative
/// source `Snapshot(timeout)` is defined against (§4.C).
pub async fn pilots_live(
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<impl IntoResponse, ControlApiError> {
    let snapshot = supervisor
        .registry
        .snapshot(Duration::from_secs(supervisor.pilot_connected_timeout_secs))
        .await;
    Ok(Json(snapshot))
}
