//! Router Gateway (§4.B): one ZeroMQ `ROUTER` endpoint per orchestrator
//! identity, with per-message confirm/retry and a thread-safe `send`.
//!
//! Grounded directly on the original's `RouterGateway.py` (a ZMQ `ROUTER`
//! socket driven by a dedicated Tornado-IOLoop thread, with `send()` safe
//! from any thread via an event-loop callback marshal and a separate
//! resend-scanner thread). The teacher crate has no message-bus code to
//! generalize — its transport is per-connection WebSocket, not an
//! identity-multiplexed bus — so this component borrows the teacher's
//! *concurrency texture* (a dedicated OS thread owning the socket, `tracing`
//! logging, `thiserror` error enum) rather than its WebSocket code, and uses
//! the real `zmq` crate for the socket pattern the original actually used.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use orch_protocol::{Envelope, IdSequence, NOREPEAT};

use crate::errors::GatewayError;

/// A registered callback for one verb. Invoked on a short-lived tokio task
/// spawned off the transport thread (§5: "handlers must not block the
/// transport thread for more than a few milliseconds").
pub type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;

enum GatewayCommand {
    Transmit(Envelope),
    Stop,
}

type Outbox = Arc<Mutex<HashMap<String, (Instant, Envelope)>>>;

/// Thread-safe bidirectional message endpoint. One instance per orchestrator
/// process; `to_string()`-addressed peers.
pub struct RouterGateway {
    id: String,
    listen_port: u16,
    listens: Arc<HashMap<String, Handler>>,
    cmd_tx: mpsc::UnboundedSender<GatewayCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<GatewayCommand>>>,
    outbox: Outbox,
    ids: IdSequence,
    closing: Arc<AtomicBool>,
    resend_interval: Duration,
    runtime: tokio::runtime::Handle,
    transport_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    resend_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Options accepted by [`RouterGateway::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub flags: HashSet<String>,
    pub repeat: bool,
}

impl RouterGateway {
    /// Construct a gateway, registering `listens` (at most one handler per
    /// key; later entries win, matching `dict.setdefault`/overwrite
    /// semantics of the original `listens` mapping). Does not bind the
    /// socket or spawn any thread until [`RouterGateway::start`] is called.
    pub fn new(
        id: impl Into<String>,
        listen_port: u16,
        listens: HashMap<String, Handler>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let id = id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            ids: IdSequence::new(id.clone()),
            id,
            listen_port,
            listens: Arc::new(listens),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            outbox: Arc::new(Mutex::new(HashMap::new())),
            closing: Arc::new(AtomicBool::new(false)),
            resend_interval: Duration::from_secs(5),
            runtime,
            transport_thread: Mutex::new(None),
            resend_thread: Mutex::new(None),
        }
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    /// Idempotent: a second call while already running is a no-op.
    pub fn start(&self) -> Result<(), GatewayError> {
        if self.transport_thread.lock().unwrap().is_some() {
            return Ok(());
        }
        self.closing.store(false, Ordering::SeqCst);

        let cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap()
            .take()
            .expect("gateway restarted without a fresh receiver");

        let id = self.id.clone();
        let port = self.listen_port;
        let listens = Arc::clone(&self.listens);
        let outbox = Arc::clone(&self.outbox);
        let closing = Arc::clone(&self.closing);
        let runtime = self.runtime.clone();
        let ids = IdSequence::new(self.id.clone());

        let transport = std::thread::Builder::new()
            .name("gateway-transport".to_owned())
            .spawn(move || transport_main(id, port, listens, outbox, closing, runtime, ids, cmd_rx))
            .expect("failed to spawn gateway transport thread");
        *self.transport_thread.lock().unwrap() = Some(transport);

        let outbox = Arc::clone(&self.outbox);
        let closing = Arc::clone(&self.closing);
        let cmd_tx = self.cmd_tx.clone();
        let resend_interval = self.resend_interval;
        let resend = std::thread::Builder::new()
            .name("gateway-resend".to_owned())
            .spawn(move || resend_main(outbox, closing, cmd_tx, resend_interval))
            .expect("failed to spawn gateway resend thread");
        *self.resend_thread.lock().unwrap() = Some(resend);

        info!(id = %self.id, port, "RouterGateway up");
        Ok(())
    }

    /// Idempotent.
    pub fn stop(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.cmd_tx.send(GatewayCommand::Stop);
        }
    }

    /// Thread-safe send: builds the envelope, hands the actual transmit off
    /// to the transport thread, and (for `repeat` envelopes that aren't
    /// `CONFIRM`/`NOREPEAT`) records it in the outbox for the resend
    /// scanner. Never blocks on the transport thread's progress.
    pub fn send(
        &self,
        to: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        options: SendOptions,
    ) -> Result<(), GatewayError> {
        let to = to.into();
        let key = key.into();
        let mut envelope = Envelope::new(self.id.clone(), to, key, value, self.ids.next());
        for flag in &options.flags {
            envelope.flags.insert(flag.clone());
        }
        envelope.validate()?;

        let should_track = options.repeat && envelope.key != "CONFIRM" && !envelope.has_flag(NOREPEAT);
        if should_track {
            self.outbox
                .lock()
                .unwrap()
                .insert(envelope.id.clone(), (Instant::now(), envelope.clone()));
        }

        self.cmd_tx
            .send(GatewayCommand::Transmit(envelope))
            .map_err(|e| GatewayError::Send(e.to_string()))
    }

    /// Convenience for one-shot sends (`START`, `STOP`, `PING`): never
    /// repeated, matching `spec.md` §6 ("No repeat needed"/"Safe to
    /// repeat" verbs are both callable without the outbox).
    pub fn send_once(&self, to: impl Into<String>, key: impl Into<String>, value: Value) -> Result<(), GatewayError> {
        self.send(to, key, value, SendOptions::default())
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }
}

#[allow(clippy::too_many_arguments)]
fn transport_main(
    id: String,
    port: u16,
    listens: Arc<HashMap<String, Handler>>,
    outbox: Outbox,
    closing: Arc<AtomicBool>,
    runtime: tokio::runtime::Handle,
    ids: IdSequence,
    mut cmd_rx: mpsc::UnboundedReceiver<GatewayCommand>,
) {
    let ctx = zmq::Context::new();
    let socket = match ctx.socket(zmq::ROUTER) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create ROUTER socket");
            return;
        }
    };
    if let Err(e) = socket.set_identity(id.as_bytes()) {
        error!(error = %e, "failed to set ROUTER identity");
        return;
    }
    if let Err(e) = socket.bind(&format!("tcp://*:{port}")) {
        error!(error = %e, port, "failed to bind ROUTER socket");
        return;
    }

    const POLL_TIMEOUT_MS: i64 = 50;

    while !closing.load(Ordering::SeqCst) {
        match socket.poll(zmq::POLLIN, POLL_TIMEOUT_MS) {
            Ok(n) if n > 0 => {
                if let Ok(frames) = socket.recv_multipart(0) {
                    handle_inbound(&socket, &id, &listens, &outbox, &runtime, &ids, frames);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "ROUTER poll failed");
            }
        }

        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                GatewayCommand::Transmit(envelope) => transmit(&socket, &envelope),
                GatewayCommand::Stop => {
                    closing.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

fn transmit(socket: &zmq::Socket, envelope: &Envelope) {
    let Ok(payload) = envelope.encode() else {
        error!(id = %envelope.id, "failed to encode outbound envelope");
        return;
    };
    let frames: [&[u8]; 2] = [envelope.to.as_bytes(), payload.as_slice()];
    if let Err(e) = socket.send_multipart(frames, 0) {
        // Swallowed per §4.B failure semantics: retried on the next resend
        // tick if this was a tracked (repeat=true) send.
        debug!(to = %envelope.to, error = %e, "transport send failed, will retry if tracked");
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_inbound(
    socket: &zmq::Socket,
    self_id: &str,
    listens: &Arc<HashMap<String, Handler>>,
    outbox: &Outbox,
    runtime: &tokio::runtime::Handle,
    ids: &IdSequence,
    frames: Vec<Vec<u8>>,
) {
    if frames.len() < 2 {
        return;
    }
    // The first frame is the ROUTER-assigned sender identity: authoritative
    // regardless of what the payload claims (§4.B, invariant 2).
    let sender_identity = String::from_utf8_lossy(&frames[0]).into_owned();
    let raw = frames.last().unwrap();

    let mut envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, from = %sender_identity, "dropping unparseable/unknown envelope");
            return;
        }
    };
    envelope.sender = sender_identity;

    if envelope.key == "CONFIRM" {
        if let Value::String(confirmed_id) = &envelope.value {
            outbox.lock().unwrap().remove(confirmed_id);
        }
        return;
    }

    if let Some(handler) = listens.get(&envelope.key) {
        let handler = Arc::clone(handler);
        let received = envelope.clone();
        runtime.spawn(async move {
            handler(received);
        });
    } else {
        warn!(key = %envelope.key, from = %envelope.sender, "no handler registered for key");
    }

    if !envelope.has_flag(NOREPEAT) {
        let confirm = envelope.confirm_for(self_id, ids.next());
        transmit(socket, &confirm);
    }
}

fn resend_main(outbox: Outbox, closing: Arc<AtomicBool>, cmd_tx: mpsc::UnboundedSender<GatewayCommand>, interval: Duration) {
    while !closing.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        let now = Instant::now();
        let stale_threshold = interval * 2;

        let due: Vec<(String, Envelope)> = {
            let mut outbox = outbox.lock().unwrap();
            let mut due = Vec::new();
            let mut expired = Vec::new();

            for (id, (first_sent, envelope)) in outbox.iter_mut() {
                if now.duration_since(*first_sent) <= stale_threshold {
                    continue;
                }
                if envelope.ttl <= 0 {
                    expired.push(id.clone());
                    continue;
                }
                envelope.ttl -= 1;
                *first_sent = now;
                due.push((id.clone(), envelope.clone()));
            }

            for id in expired {
                outbox.remove(&id);
                warn!(id = %id, "envelope expired (ttl exhausted), dropping");
            }

            due
        };

        for (id, envelope) in due {
            debug!(id = %id, to = %envelope.to, "resending unconfirmed envelope");
            if cmd_tx.send(GatewayCommand::Transmit(envelope)).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_options_default_does_not_repeat() {
        let options = SendOptions::default();
        assert!(!options.repeat);
        assert!(options.flags.is_empty());
    }
}
