//! Supervisor (§4.I): wires every component together, registers gateway
//! handlers for the inbound verbs (§6), and drives the ping loop and
//! optional watchdog (§4.J). Generalizes `OrchestratorStation.__init__`'s
//! thread-spawning constructor and the commented-out `_run_watchdog` call.
//!
//! Wiring order resolves the cycle between the gateway (needs handlers that
//! touch the controller) and the controller (needs the gateway to send
//! `START`/`STOP`): the gateway and pipeline are built first with handlers
//! that only touch the registry/pipeline, the controller is built on top of
//! the gateway, and the two verbs that need the controller
//! (`INC_TRIAL_COUNTER`, `TASK_ERROR`) are drained from channels by tasks
//! spawned after the controller exists — dependency injection at wiring
//! time, not an import cycle (§9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use orch_protocol::{DataEvent, HandshakePayload, IncTrialPayload, TaskErrorPayload};

use crate::backend::BackendClient;
use crate::config::Config;
use crate::controller::RunController;
use crate::gateway::{Handler, RouterGateway};
use crate::mirror::{Mirror, NoopMirror, RedisMirror};
use crate::pipeline::{DataEventEnvelope, DataPipeline, TrialEvent};
use crate::registry::PilotRegistry;

/// `api.py`'s `PILOT_TIMEOUT_SEC`, reused for `GET /pilots/live` staleness.
pub const PILOT_CONNECTED_TIMEOUT_SECS: u64 = 15;

/// A `TASK_ERROR` envelope, lifted off the transport thread and handed to
/// the controller by a dedicated consumer task (mirrors the trial queue's
/// treatment of `INC_TRIAL_COUNTER`, since both handlers need the
/// controller that does not exist yet at gateway-construction time).
struct TaskErrorEvent {
    pilot_key: String,
    subject: Option<String>,
    error_message: String,
}

pub struct Supervisor {
    pub registry: PilotRegistry,
    pub gateway: Arc<RouterGateway>,
    pub controller: Arc<RunController>,
    pub pipeline: Arc<DataPipeline>,
    pub pilot_connected_timeout_secs: u64,
}

impl Supervisor {
    /// Builds every component and registers the gateway's inbound handlers,
    /// but does not start the transport thread or background loops — call
    /// [`Supervisor::run`]/[`Supervisor::start`] for that.
    pub fn new(config: &Config, runtime: tokio::runtime::Handle) -> Arc<Self> {
        let registry = PilotRegistry::new();
        let backend = BackendClient::new(config.backend_url.clone(), config.backend_token.clone());

        let mirror: Arc<dyn Mirror> = match &config.redis_url {
            Some(url) => match RedisMirror::connect(url) {
                Ok(mirror) => Arc::new(mirror),
                Err(e) => {
                    error!(error = %e, "failed to connect redis mirror, falling back to no-op");
                    Arc::new(NoopMirror)
                }
            },
            None => Arc::new(NoopMirror),
        };

        let (pipeline, trial_rx) = DataPipeline::spawn(
            &config.sink_url,
            "orchestrator-events".to_owned(),
            config.queue_capacity,
            config.data_workers,
            config.sink_request_timeout,
        );
        let pipeline = Arc::new(pipeline);

        let (task_error_tx, task_error_rx) = mpsc::unbounded_channel::<TaskErrorEvent>();

        let listens = build_handlers(
            registry.clone(),
            backend.clone(),
            Arc::clone(&mirror),
            Arc::clone(&pipeline),
            task_error_tx,
        );
        let gateway = Arc::new(
            RouterGateway::new(config.name.clone(), config.msg_port, listens, runtime)
                .with_resend_interval(config.resend_interval),
        );

        let controller = Arc::new(RunController::new(
            backend,
            registry.clone(),
            Arc::clone(&gateway),
            mirror,
            config.wait_idle_timeout,
            config.hardware_release_interval,
        ));

        spawn_trial_consumer(Arc::clone(&controller), trial_rx);
        spawn_task_error_consumer(Arc::clone(&controller), task_error_rx);

        Arc::new(Self {
            registry,
            gateway,
            controller,
            pipeline,
            pilot_connected_timeout_secs: PILOT_CONNECTED_TIMEOUT_SECS,
        })
    }

    /// Starts the transport, resend, ping, and (optionally) watchdog loops.
    pub fn start(self: &Arc<Self>, config: &Config) -> Result<(), crate::errors::GatewayError> {
        self.gateway.start()?;
        self.spawn_ping_loop(config.ping_interval);
        if config.watchdog_enabled {
            self.spawn_watchdog(config.watchdog_poll_interval, config.watchdog_stuck_threshold);
        }
        Ok(())
    }

    fn spawn_ping_loop(self: &Arc<Self>, interval: Duration) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let snapshot = supervisor
                    .registry
                    .snapshot(Duration::from_secs(supervisor.pilot_connected_timeout_secs))
                    .await;
                for pilot in snapshot.keys() {
                    if let Err(e) = supervisor.gateway.send_once(pilot.clone(), "PING", Value::Null) {
                        warn!(pilot = %pilot, error = %e, "ping send failed");
                    }
                }
            }
        });
    }

    /// §4.J, §9 Open Question: opt-in via `Config::watchdog_enabled`. Force-errors
    /// any run that has been `running` longer than `stuck_threshold`.
    fn spawn_watchdog(self: &Arc<Self>, poll_interval: Duration, stuck_threshold: Duration) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            info!("run watchdog started");
            loop {
                tokio::time::sleep(poll_interval).await;
                let snapshot = supervisor
                    .registry
                    .snapshot(Duration::from_secs(supervisor.pilot_connected_timeout_secs))
                    .await;

                for (pilot, info) in snapshot {
                    let Some(run) = info.active_run else { continue };
                    if run.status != "running" {
                        continue;
                    }
                    let Ok(started_at) = chrono::DateTime::parse_from_rfc3339(&run.started_at) else {
                        warn!(pilot = %pilot, run_id = run.id, started_at = %run.started_at, "watchdog: invalid started_at");
                        continue;
                    };
                    let elapsed = chrono::Utc::now().signed_duration_since(started_at.with_timezone(&chrono::Utc));
                    if elapsed.num_seconds() as u64 <= stuck_threshold.as_secs() {
                        continue;
                    }

                    error!(run_id = run.id, pilot = %pilot, elapsed_secs = elapsed.num_seconds(), "watchdog: run stuck running");
                    if let Err(e) = supervisor
                        .controller
                        .backend_mark_stuck(run.id, elapsed.num_seconds())
                        .await
                    {
                        error!(run_id = run.id, error = %e, "watchdog: failed marking run errored");
                    }
                    supervisor.registry.set_active_run(&pilot, None).await;
                }
            }
        });
    }
}

/// Drains `INC_TRIAL_COUNTER` events into `RunController::on_inc_trial`.
/// Runs on its own task so a slow backend call serializes trial processing
/// per the concurrency model (§5: "trial events for a given run are
/// processed in a single trial worker and therefore serialized per run")
/// without blocking the transport thread.
fn spawn_trial_consumer(controller: Arc<RunController>, mut trial_rx: mpsc::Receiver<TrialEvent>) {
    tokio::spawn(async move {
        while let Some(event) = trial_rx.recv().await {
            if let Err(e) = controller.on_inc_trial(&event.subject).await {
                warn!(subject = %event.subject, error = %e, "failed to process INC_TRIAL_COUNTER");
            }
        }
    });
}

fn spawn_task_error_consumer(controller: Arc<RunController>, mut rx: mpsc::UnboundedReceiver<TaskErrorEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            controller
                .on_task_error(&event.pilot_key, event.subject.as_deref(), &event.error_message)
                .await;
        }
    });
}

/// Registers one handler per inbound verb (§6). Handlers are cheap
/// closures that hand off to the registry/pipeline/controller and return
/// immediately, matching §5's "must not block the transport thread" rule.
fn build_handlers(
    registry: PilotRegistry,
    backend: BackendClient,
    mirror: Arc<dyn Mirror>,
    pipeline: Arc<DataPipeline>,
    task_error_tx: mpsc::UnboundedSender<TaskErrorEvent>,
) -> HashMap<String, Handler> {
    let mut listens: HashMap<String, Handler> = HashMap::new();

    {
        let registry = registry.clone();
        let backend = backend.clone();
        let mirror = Arc::clone(&mirror);
        listens.insert(
            "HANDSHAKE".to_owned(),
            Arc::new(move |envelope| {
                let registry = registry.clone();
                let backend = backend.clone();
                let mirror = Arc::clone(&mirror);
                let pilot = envelope.sender.clone();
                tokio::spawn(async move {
                    let payload: HandshakePayload = match serde_json::from_value(envelope.value) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(pilot = %pilot, error = %e, "malformed HANDSHAKE payload");
                            return;
                        }
                    };
                    let pilot_key = payload.pilot.clone().unwrap_or(pilot);
                    registry
                        .update_handshake(&pilot_key, payload.ip.clone(), payload.prefs.clone(), payload.tasks.clone())
                        .await;
                    mirror.touch(&pilot_key).await;

                    // `orchestrator_station.py`'s `on_handshake`: upsert the
                    // pilot directory row, then its task catalog if any was
                    // declared. Best-effort, matching the original's
                    // try/except — a backend hiccup here never blocks the
                    // registry update above.
                    match backend
                        .create_or_update_pilot(&pilot_key, payload.ip.as_deref(), payload.prefs)
                        .await
                    {
                        Ok(backend_pilot) => {
                            if !payload.tasks.is_empty() {
                                if let Err(e) = backend
                                    .upsert_pilot_tasks(backend_pilot.id, payload.tasks)
                                    .await
                                {
                                    warn!(pilot = %pilot_key, error = %e, "failed to upsert pilot tasks");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(pilot = %pilot_key, error = %e, "failed to upsert pilot in backend");
                        }
                    }

                    info!(pilot = %pilot_key, "HANDSHAKE");
                });
            }) as Handler,
        );
    }

    {
        let registry = registry.clone();
        let mirror = Arc::clone(&mirror);
        listens.insert(
            "STATE".to_owned(),
            Arc::new(move |envelope| {
                let registry = registry.clone();
                let mirror = Arc::clone(&mirror);
                tokio::spawn(async move {
                    let pilot = envelope.sender.clone();
                    // §6: STATE's payload is the opaque state string itself
                    // (e.g. "IDLE"/"RUNNING"), not an object wrapping one --
                    // `wait_for_idle` depends on this being recorded verbatim.
                    let state = envelope.value.as_str().unwrap_or("UNKNOWN");
                    registry.set_state(&pilot, state).await;
                    mirror.touch(&pilot).await;
                });
            }) as Handler,
        );
    }

    {
        let registry = registry.clone();
        let mirror = Arc::clone(&mirror);
        listens.insert(
            "PING".to_owned(),
            Arc::new(move |envelope| {
                let registry = registry.clone();
                let mirror = Arc::clone(&mirror);
                tokio::spawn(async move {
                    registry.update_ping(&envelope.sender).await;
                    mirror.touch(&envelope.sender).await;
                });
            }) as Handler,
        );
    }

    for verb in ["DATA", "CONTINUOUS", "STREAM"] {
        let pipeline = Arc::clone(&pipeline);
        listens.insert(
            verb.to_owned(),
            Arc::new(move |envelope| {
                let event: DataEvent = match serde_json::from_value(envelope.value.clone()) {
                    Ok(event) => event,
                    Err(_) => return,
                };
                pipeline.push_data(DataEventEnvelope { subject: event.subject, raw: envelope.value });
            }) as Handler,
        );
    }

    {
        let pipeline = Arc::clone(&pipeline);
        listens.insert(
            "INC_TRIAL_COUNTER".to_owned(),
            Arc::new(move |envelope| {
                let payload: IncTrialPayload = match serde_json::from_value(envelope.value) {
                    Ok(payload) => payload,
                    Err(_) => return,
                };
                pipeline.push_trial(TrialEvent { subject: payload.subject });
            }) as Handler,
        );
    }

    {
        listens.insert(
            "TASK_ERROR".to_owned(),
            Arc::new(move |envelope| {
                let sender = envelope.sender.clone();
                let tx = task_error_tx.clone();
                let payload: Result<TaskErrorPayload, _> = serde_json::from_value(envelope.value);
                let Ok(payload) = payload else {
                    warn!(pilot = %sender, "malformed TASK_ERROR payload");
                    return;
                };
                let pilot_key = payload.pilot.unwrap_or(sender);
                if tx
                    .send(TaskErrorEvent {
                        pilot_key,
                        subject: payload.subject,
                        error_message: payload.error_message,
                    })
                    .is_err()
                {
                    error!("TASK_ERROR consumer task has exited, dropping event");
                }
            }) as Handler,
        );
    }

    listens
}
