//! In-memory and cached shapes the orchestrator reasons about.
//!
//! `PilotRecord` is the only authoritative local state (§3); `RunCache`,
//! `ProgressCache` and `ProtocolStep` are read-through caches of backend rows,
//! never written back except through the backend client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A pilot's local record: connectivity, declared state, and the run the
/// orchestrator believes is currently executing on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PilotRecord {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Monotonic seconds (`Instant`-derived); not serialized across process
    /// boundaries, only used for `snapshot`'s `last_seen_sec`.
    #[serde(skip)]
    pub last_seen: Option<std::time::Instant>,
    #[serde(default)]
    pub active_run: Option<ActiveRun>,
    #[serde(default)]
    pub prefs: Value,
    #[serde(default)]
    pub tasks: Vec<Value>,
}

/// The orchestrator's local record of what a pilot is currently executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub id: i64,
    pub session_id: i64,
    pub subject_key: String,
    pub started_at: String,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "running".to_owned()
}

/// Snapshot row returned by `PilotRegistry::snapshot`, mirrored verbatim into
/// the `GET /pilots/live` response and the KV mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotSnapshot {
    pub connected: bool,
    pub last_seen_sec: Option<f64>,
    pub state: Option<String>,
    pub ip: Option<String>,
    pub active_run: Option<ActiveRun>,
}

/// Run status as understood by the backend (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Stopped,
    Completed,
    Error,
}

/// Run start mode (§3); only meaningful on `StartRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    New,
    Resume,
    Restart,
}

/// Cache of a backend `session-run` row, keyed by run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCache {
    pub id: i64,
    pub session_id: i64,
    pub pilot_id: i64,
    pub subject_key: String,
    pub status: RunStatus,
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub overrides: Option<Value>,
    #[serde(default)]
    pub session_run_index: Option<i64>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Cache of a backend progress row for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressCache {
    #[serde(default)]
    pub current_step: Option<i64>,
    #[serde(default)]
    pub current_trial: Option<i64>,
    #[serde(default)]
    pub graduation_type: Option<String>,
    #[serde(default)]
    pub graduation_params: Option<Value>,
    #[serde(default)]
    pub session_progress_index: Option<i64>,
}

/// A single read-only protocol step fetched from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub order_index: i64,
    pub step_name: String,
    pub task_type: String,
    #[serde(default)]
    pub params: Value,
}

/// A full protocol (ordered steps) as returned by `GET /protocols/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    pub id: i64,
    pub steps: Vec<ProtocolStep>,
}

/// Pilot directory row as known to the backend (distinct from `PilotRecord`,
/// which is the orchestrator's own transport-identity bookkeeping).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendPilot {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
}

/// One row of `GET /sessions/{id}` (the "SubjectProtocolRun" rows the
/// original calls `proto_runs`): carries the protocol id shared by every run
/// in the session and the subject name used to build the `subjects` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRun {
    pub protocol_id: i64,
    #[serde(default)]
    pub subject_key: Option<String>,
    #[serde(default)]
    pub subject_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pilot_record_deserializes_without_active_run() {
        let record: PilotRecord = serde_json::from_value(json!({"ip": "10.0.0.1"})).unwrap();
        assert_eq!(record.ip.as_deref(), Some("10.0.0.1"));
        assert!(record.active_run.is_none());
    }

    #[test]
    fn run_status_round_trips_lowercase() {
        let value = serde_json::to_value(RunStatus::Running).unwrap();
        assert_eq!(value, json!("running"));
        let back: RunStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, RunStatus::Running);
    }
}
