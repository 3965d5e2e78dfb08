//! Run Controller (§4.F): owns run lifecycle transitions and task-payload
//! construction. Directly generalizes `OrchestratorStation`'s control-flow
//! methods (`start_run`, `stop_run`, `_advance_run_step`, `on_task_error`,
//! `_build_first_step_task`/`_build_step_task`, `_apply_overrides`,
//! `_attach_session_context`, `_wait_for_idle`) into `Result`-returning
//! async methods (§9 redesign: exceptions become `Result`, matching the
//! teacher's `?`-propagation style instead of the original's broad
//! `except Exception` blocks).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::backend::BackendClient;
use crate::domain::{ActiveRun, BackendPilot, Protocol, ProtocolStep, RunCache, SubjectRun};
use crate::errors::ControllerError;
use crate::gateway::RouterGateway;
use crate::mirror::Mirror;
use crate::registry::PilotRegistry;

pub struct RunController {
    backend: BackendClient,
    registry: PilotRegistry,
    gateway: Arc<RouterGateway>,
    mirror: Arc<dyn Mirror>,
    wait_idle_timeout: Duration,
    hardware_release_interval: Duration,
}

impl RunController {
    pub fn new(
        backend: BackendClient,
        registry: PilotRegistry,
        gateway: Arc<RouterGateway>,
        mirror: Arc<dyn Mirror>,
        wait_idle_timeout: Duration,
        hardware_release_interval: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            gateway,
            mirror,
            wait_idle_timeout,
            hardware_release_interval,
        }
    }

    async fn resolve_pilot_key(&self, pilot: &BackendPilot) -> Result<String, ControllerError> {
        Ok(self
            .registry
            .resolve_pilot_key(Some(&pilot.name), pilot.ip.as_deref())
            .await?)
    }

    /// §8 scenario 1/2: builds the step task (fresh or resumed from cached
    /// progress), sends `START` before marking the backend `running` — the
    /// ordering invariant that keeps backend and pilot from diverging on a
    /// transport failure.
    pub async fn start_run(&self, run_id: i64) -> Result<(), ControllerError> {
        info!(run_id, "starting run");

        let run = self.backend.get_run(run_id).await?;
        let pilot = self.backend.get_pilot(run.pilot_id).await?;
        let pilot_key = self.resolve_pilot_key(&pilot).await?;
        info!(run_id, pilot_key = %pilot_key, "resolved pilot key");

        let proto_runs = self.backend.get_subject_runs_for_session(run.session_id).await?;
        if proto_runs.is_empty() {
            return Err(ControllerError::EmptySession(run.session_id));
        }
        let protocol_id = proto_runs[0].protocol_id;

        let progress = match self.backend.get_run_with_progress(run_id).await {
            Ok(with_progress) => with_progress.progress,
            Err(e) => {
                warn!(run_id, error = %e, "failed to fetch run progress, starting from step 0");
                None
            }
        };

        let (mut task, current_trial) = match progress.as_ref().and_then(|p| p.current_step) {
            Some(step_idx) => {
                let task = self.build_step_task(&run, &pilot, protocol_id, step_idx).await?;
                let trial = progress.as_ref().and_then(|p| p.current_trial).unwrap_or(0);
                info!(run_id, step_idx, trial, "resuming run");
                (task, trial)
            }
            None => {
                let task = self.build_step_task(&run, &pilot, protocol_id, 0).await?;
                info!(run_id, "starting run from step 0");
                (task, 0)
            }
        };
        task["current_trial"] = json!(current_trial);
        task["run_id"] = json!(run.id);
        task["pilot"] = json!(pilot.name);
        task["subject"] = json!(run.subject_key);

        self.attach_session_context(&mut task, &proto_runs, progress.as_ref());

        if let Err(e) = self.gateway.send_once(pilot_key.clone(), "START", task) {
            error!(run_id, pilot_key = %pilot_key, error = %e, "failed to send START");
            if let Err(mark_err) = self
                .backend
                .mark_run_error(run_id, "OrchGatewayError", &e.to_string())
                .await
            {
                error!(run_id, error = %mark_err, "failed to mark run error after gateway failure");
            }
            self.registry.set_active_run(&pilot_key, None).await;
            self.mirror.set_active_run(&pilot_key, None).await;
            return Err(e.into());
        }
        info!(run_id, pilot_key = %pilot_key, "START sent");

        if let Err(e) = self.backend.mark_run_running(run_id).await {
            error!(run_id, error = %e, "failed to mark run RUNNING in backend after sending START");
        } else {
            info!(run_id, "marked run RUNNING in backend");
        }

        let active_run = ActiveRun {
            id: run.id,
            session_id: run.session_id,
            subject_key: run.subject_key.clone(),
            started_at: Utc::now().to_rfc3339(),
            status: "running".to_owned(),
        };
        self.registry.set_active_run(&pilot_key, Some(active_run.clone())).await;
        self.mirror.set_active_run(&pilot_key, Some(&active_run)).await;
        self.mirror.set_state(&pilot_key, "RUNNING").await;

        info!(run_id, pilot_key = %pilot_key, "active run set");
        Ok(())
    }

    /// §8 scenario: no retries on backend failure after STOP is sent —
    /// logged and continued, matching the original's explicit comment
    /// ("No retries per request — log and continue").
    pub async fn stop_run(&self, run_id: i64) -> Result<(), ControllerError> {
        let run = self.backend.get_run(run_id).await?;
        let pilot = self.backend.get_pilot(run.pilot_id).await?;
        let pilot_key = self.resolve_pilot_key(&pilot).await?;

        info!(run_id, pilot_key = %pilot_key, "stopping run");

        if let Err(e) = self.gateway.send_once(pilot_key.clone(), "STOP", Value::Null) {
            error!(run_id, pilot_key = %pilot_key, error = %e, "failed to send STOP");
            if let Err(mark_err) = self
                .backend
                .mark_run_error(run_id, "OrchGatewayError", &e.to_string())
                .await
            {
                error!(run_id, error = %mark_err, "failed to mark run error after STOP gateway failure");
            }
            self.registry.set_active_run(&pilot_key, None).await;
            self.mirror.set_active_run(&pilot_key, None).await;
            return Err(e.into());
        }
        info!(run_id, pilot_key = %pilot_key, "STOP sent");

        if let Err(e) = self.backend.stop_session_run(run_id).await {
            error!(run_id, error = %e, "failed to mark run STOPPED in backend after sending STOP");
        } else {
            info!(run_id, "marked run STOPPED in backend");
        }

        self.registry.set_active_run(&pilot_key, None).await;
        self.mirror.set_active_run(&pilot_key, None).await;
        self.mirror.set_state(&pilot_key, "IDLE").await;

        info!(run_id, pilot_key = %pilot_key, "active run cleared");
        Ok(())
    }

    /// Invoked by the `INC_TRIAL_COUNTER` pipeline worker (§6). Looks up the
    /// run by subject key, skips anything not currently `running`, then
    /// advances the step if the backend signals graduation.
    pub async fn on_inc_trial(&self, subject_key: &str) -> Result<(), ControllerError> {
        let run = self.backend.get_run_by_subject_key(subject_key).await?;
        if run.status != crate::domain::RunStatus::Running {
            return Ok(());
        }

        let resp = self.backend.increment_trial(run.id).await?;
        if resp.should_graduate {
            self.advance_run_step(&run).await?;
        }
        Ok(())
    }

    /// §8 scenario: graduation loop. STOP -> wait for idle -> advance step in
    /// backend -> complete or sleep (hardware release) -> START next step.
    async fn advance_run_step(&self, run: &RunCache) -> Result<(), ControllerError> {
        let pilot = self.backend.get_pilot(run.pilot_id).await?;
        let pilot_key = self.resolve_pilot_key(&pilot).await?;

        info!(run_id = run.id, pilot = %pilot.name, "advancing run");

        self.gateway.send_once(pilot_key.clone(), "STOP", Value::Null)?;
        self.wait_for_idle(&pilot_key).await;

        let resp = self.backend.advance_step(run.id).await?;

        if resp.finished {
            info!(run_id = run.id, "run completed");
            self.backend.complete_session_run(run.id).await?;
            self.registry.set_active_run(&pilot_key, None).await;
            self.mirror.set_active_run(&pilot_key, None).await;
            self.mirror.set_state(&pilot_key, "IDLE").await;
            return Ok(());
        }

        info!(
            pilot = %pilot.name,
            seconds = self.hardware_release_interval.as_secs(),
            "waiting for hardware release before next step"
        );
        tokio::time::sleep(self.hardware_release_interval).await;

        let next_step_idx = resp.current_step.ok_or(ControllerError::RunNotFound(run.id))?;
        let proto_runs = match self.backend.get_subject_runs_for_session(run.session_id).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(run_id = run.id, error = %e, "failed to fetch subject runs for next step");
                Vec::new()
            }
        };
        let protocol_id = proto_runs
            .first()
            .map(|r| r.protocol_id)
            .ok_or(ControllerError::EmptySession(run.session_id))?;

        let mut next_task = self.build_step_task(run, &pilot, protocol_id, next_step_idx).await?;

        let progress = match self.backend.get_run_with_progress(run.id).await {
            Ok(with_progress) => with_progress.progress,
            Err(e) => {
                warn!(run_id = run.id, error = %e, "failed to fetch progress for next step");
                None
            }
        };
        self.attach_session_context(&mut next_task, &proto_runs, progress.as_ref());

        info!(step = next_step_idx, run_id = run.id, pilot = %pilot.name, "starting next step");
        self.gateway.send_once(pilot_key, "START", next_task)?;
        Ok(())
    }

    /// Hard-stops the pilot, marks the affected run errored, and clears
    /// local/mirrored active-run state (§6 `TASK_ERROR`, §8 scenario 3).
    pub async fn on_task_error(&self, pilot_key: &str, subject_key: Option<&str>, error_message: &str) {
        error!(pilot_key, subject_key, error_message, "TASK_ERROR received");

        if let Err(e) = self.gateway.send_once(pilot_key, "STOP", Value::Null) {
            warn!(pilot_key, error = %e, "failed to hard-stop pilot after TASK_ERROR");
        }

        let run = match subject_key {
            Some(key) => self.backend.get_run_by_subject_key(key).await.ok(),
            None => None,
        };

        let Some(run) = run else {
            self.registry.set_active_run(pilot_key, None).await;
            self.mirror.set_active_run(pilot_key, None).await;
            return;
        };

        if let Err(e) = self
            .backend
            .mark_run_error(run.id, "TaskError", error_message)
            .await
        {
            error!(run_id = run.id, error = %e, "failed to mark run errored after TASK_ERROR");
        }

        self.registry.set_active_run(pilot_key, None).await;
        self.mirror.set_active_run(pilot_key, None).await;
    }

    /// §4.J watchdog: force-errors a run the registry snapshot shows stuck
    /// `running` past the configured threshold. Does not touch the pilot —
    /// the watchdog only clears local/registry state; a wedged pilot is the
    /// operator's problem once the backend has recorded the failure.
    pub async fn backend_mark_stuck(&self, run_id: i64, elapsed_secs: i64) -> Result<(), ControllerError> {
        self.backend
            .mark_run_error(
                run_id,
                "WatchdogTimeout",
                &format!("run stuck in running for {elapsed_secs}s"),
            )
            .await?;
        Ok(())
    }

    async fn wait_for_idle(&self, pilot_key: &str) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < self.wait_idle_timeout {
            if let Some(record) = self.registry.get_pilot(pilot_key).await {
                if record.state.as_deref() == Some("IDLE") {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Generalizes `_build_first_step_task`/`_build_step_task`: both were
    /// identical except for the step index, so they collapse into one
    /// helper parameterized on `step_idx`.
    async fn build_step_task(
        &self,
        run: &RunCache,
        pilot: &BackendPilot,
        protocol_id: i64,
        step_idx: i64,
    ) -> Result<Value, ControllerError> {
        let protocol: Protocol = self.backend.get_protocol(protocol_id).await?;
        let step: &ProtocolStep = protocol
            .steps
            .get(step_idx as usize)
            .ok_or(ControllerError::RunNotFound(run.id))?;

        let mut task = step.params.clone();
        if !task.is_object() {
            task = json!({});
        }
        task["task_type"] = json!(step.task_type);
        task["step_name"] = json!(step.step_name);
        task["pilot"] = json!(pilot.name);
        task["subject"] = json!(run.subject_key);
        task["step"] = json!(step_idx);
        task["current_trial"] = json!(0);
        task["session"] = json!(run.session_id);
        task["run_id"] = json!(run.id);
        task["protocol_id"] = json!(protocol_id);

        self.apply_overrides(&mut task, run, step_idx);

        // Reserved-key re-assertion: overrides must never hijack routing or
        // meta fields (§4.F).
        task["task_type"] = json!(step.task_type);
        task["step_name"] = json!(step.step_name);
        task["pilot"] = json!(pilot.name);
        task["subject"] = json!(run.subject_key);
        task["session"] = json!(run.session_id);
        task["step"] = json!(step_idx);
        task["run_id"] = json!(run.id);
        task["protocol_id"] = json!(protocol_id);

        Ok(task)
    }

    fn apply_overrides(&self, task: &mut Value, run: &RunCache, step_idx: i64) {
        let Some(overrides) = run.overrides.as_ref() else {
            return;
        };
        let global = overrides.get("global").cloned().unwrap_or(Value::Null);
        let steps = overrides.get("steps").cloned().unwrap_or(Value::Null);
        let step_override = steps
            .get(step_idx.to_string())
            .or_else(|| usize::try_from(step_idx).ok().and_then(|idx| steps.get(idx)))
            .cloned()
            .unwrap_or(Value::Null);

        merge_object(task, &global);
        merge_object(task, &step_override);
    }

    /// §4.F: always forces `session_progress_index` and `subjects` to be
    /// present (possibly `null`/`[]`), tolerating different field-naming
    /// across backend schema revisions the way the original does.
    fn attach_session_context(
        &self,
        task: &mut Value,
        proto_runs: &[SubjectRun],
        progress: Option<&crate::domain::ProgressCache>,
    ) {
        let spi = progress.and_then(|p| p.session_progress_index);
        task["session_progress_index"] = match spi {
            Some(value) => json!(value),
            None => Value::Null,
        };

        let mut seen = BTreeMap::new();
        let mut subjects = Vec::new();
        for run in proto_runs {
            let name = run.subject_name.clone().or_else(|| run.subject_key.clone());
            if let Some(name) = name {
                if seen.insert(name.clone(), ()).is_none() {
                    subjects.push(name);
                }
            }
        }
        task["subjects"] = json!(subjects);
    }
}

fn merge_object(target: &mut Value, source: &Value) {
    let Value::Object(source) = source else {
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let target_map = target.as_object_mut().expect("just ensured object");
    for (key, value) in source {
        target_map.insert(key.clone(), value.clone());
    }
}
