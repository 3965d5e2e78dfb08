//! Pilot State Registry (§4.C): thread-safe in-memory map of pilot identity
//! to connectivity/run bookkeeping. Directly generalizes the teacher's
//! `AppState` (`Arc<RwLock<HashMap<...>>>` fields, async read/write methods
//! returning owned clones) and the original's `OrchestratorState`
//! (preserve-active-run merge, three-step `resolve_pilot_key`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::{ActiveRun, PilotRecord, PilotSnapshot};
use crate::errors::RegistryError;

#[derive(Clone)]
pub struct PilotRegistry {
    pilots: Arc<RwLock<HashMap<String, PilotRecord>>>,
}

impl Default for PilotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PilotRegistry {
    pub fn new() -> Self {
        Self {
            pilots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Merge a `HANDSHAKE` payload into the pilot's record. `active_run` is
    /// explicitly preserved — a pilot re-announcing itself never clears a
    /// run the orchestrator believes to be active (§3 invariant, scenario 5).
    pub async fn update_handshake(&self, pilot: &str, ip: Option<String>, prefs: Value, tasks: Vec<Value>) {
        let mut pilots = self.pilots.write().await;
        let entry = pilots.entry(pilot.to_owned()).or_default();
        let preserved_active_run = entry.active_run.clone();
        if ip.is_some() {
            entry.ip = ip;
        }
        entry.prefs = prefs;
        entry.tasks = tasks;
        entry.active_run = preserved_active_run;
        entry.last_seen = Some(Instant::now());
    }

    pub async fn update_ping(&self, pilot: &str) {
        let mut pilots = self.pilots.write().await;
        let entry = pilots.entry(pilot.to_owned()).or_default();
        entry.last_seen = Some(Instant::now());
    }

    pub async fn set_state(&self, pilot: &str, state_value: impl Into<String>) {
        let mut pilots = self.pilots.write().await;
        let entry = pilots.entry(pilot.to_owned()).or_default();
        entry.state = Some(state_value.into());
        entry.last_seen = Some(Instant::now());
    }

    pub async fn set_active_run(&self, pilot: &str, run: Option<ActiveRun>) {
        let mut pilots = self.pilots.write().await;
        pilots.entry(pilot.to_owned()).or_default().active_run = run;
    }

    pub async fn get_pilot(&self, pilot: &str) -> Option<PilotRecord> {
        self.pilots.read().await.get(pilot).cloned()
    }

    /// Any pilot that has ever handshaken is considered present: staleness
    /// detection is advisory here, the transport's confirm loop is the real
    /// failure signal (§4.C). `timeout` is accepted for interface parity
    /// with `snapshot` but does not gate this check, matching the original.
    pub async fn is_connected(&self, pilot: &str, _timeout: std::time::Duration) -> bool {
        self.pilots.read().await.contains_key(pilot)
    }

    pub async fn snapshot(&self, timeout: std::time::Duration) -> HashMap<String, PilotSnapshot> {
        let now = Instant::now();
        let pilots = self.pilots.read().await;
        pilots
            .iter()
            .map(|(pilot, record)| {
                let age = record.last_seen.map(|seen| now.duration_since(seen));
                let snapshot = PilotSnapshot {
                    connected: age.is_some_and(|age| age < timeout),
                    last_seen_sec: age.map(|age| age.as_secs_f64()),
                    state: record.state.clone(),
                    ip: record.ip.clone(),
                    active_run: record.active_run.clone(),
                };
                (pilot.clone(), snapshot)
            })
            .collect()
    }

    /// Identity bridge (§4.C): exact `db_name` match, then `pilot_{db_name}`,
    /// then lookup by `ip`.
    pub async fn resolve_pilot_key(
        &self,
        db_name: Option<&str>,
        ip: Option<&str>,
    ) -> Result<String, RegistryError> {
        let pilots = self.pilots.read().await;

        if let Some(name) = db_name {
            if pilots.contains_key(name) {
                return Ok(name.to_owned());
            }
            let prefixed = format!("pilot_{name}");
            if pilots.contains_key(&prefixed) {
                return Ok(prefixed);
            }
        }

        if let Some(ip) = ip {
            if let Some((key, _)) = pilots.iter().find(|(_, record)| record.ip.as_deref() == Some(ip)) {
                return Ok(key.clone());
            }
        }

        Err(RegistryError::PilotNotFound {
            db_name: db_name.map(str::to_owned),
            ip: ip.map(str::to_owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn handshake_preserves_active_run() {
        let registry = PilotRegistry::new();
        let run = ActiveRun {
            id: 22,
            session_id: 3,
            subject_key: "bp_s3_r22".into(),
            started_at: "2026-01-01T00:00:00Z".into(),
            status: "running".into(),
        };
        registry.set_active_run("gamma", Some(run.clone())).await;

        registry
            .update_handshake("gamma", Some("10.0.0.5".into()), json!({}), vec![])
            .await;

        let pilot = registry.get_pilot("gamma").await.unwrap();
        assert_eq!(pilot.active_run, Some(run));
    }

    #[tokio::test]
    async fn resolve_pilot_key_tries_exact_then_prefixed_then_ip() {
        let registry = PilotRegistry::new();
        registry
            .update_handshake("pilot_rpi_1", Some("192.0.2.5".into()), json!({}), vec![])
            .await;

        assert_eq!(
            registry.resolve_pilot_key(Some("rpi_1"), None).await.unwrap(),
            "pilot_rpi_1"
        );
        assert_eq!(
            registry
                .resolve_pilot_key(None, Some("192.0.2.5"))
                .await
                .unwrap(),
            "pilot_rpi_1"
        );
        assert!(registry.resolve_pilot_key(Some("nope"), None).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_reports_connectivity_and_active_run() {
        let registry = PilotRegistry::new();
        registry
            .update_handshake("alpha", Some("10.0.0.1".into()), json!({}), vec![])
            .await;
        registry.set_state("alpha", "IDLE").await;

        let snapshot = registry.snapshot(std::time::Duration::from_secs(15)).await;
        let alpha = snapshot.get("alpha").unwrap();
        assert!(alpha.connected);
        assert_eq!(alpha.state.as_deref(), Some("IDLE"));
        assert!(alpha.active_run.is_none());
    }
}
