//! A test double that speaks the pilot<->orchestrator wire protocol directly
//! over a loopback ZeroMQ `DEALER` socket, the way a real pilot would connect
//! to a `RouterGateway`'s bound port. Mirrors the teacher's
//! `rt-test-utils::MockWsClient`, generalized from a WebSocket peer to an
//! identity-addressed ZMQ peer.

use std::sync::{Arc, Mutex};

use orch_protocol::{Envelope, IdSequence};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MockPilotError {
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("codec error: {0}")]
    Codec(#[from] orch_protocol::CodecError),
    #[error("receive timed out waiting for the orchestrator")]
    Timeout,
}

/// Default receive timeout: generous relative to the gateway's 5 s resend
/// interval so a single test poll never races a legitimate retransmission.
const DEFAULT_RECV_TIMEOUT_MS: i32 = 2_000;

pub struct MockPilot {
    identity: String,
    // `zmq::Socket` is `Send` but not `Sync`, so a bare `Arc<Socket>` can't
    // cross into a `spawn_blocking` closure; the mutex buys back `Sync` at
    // the cost of serializing this test double's own send/recv calls, which
    // is the same one-message-at-a-time usage a real DEALER socket expects.
    socket: Arc<Mutex<zmq::Socket>>,
    ids: IdSequence,
    _ctx: zmq::Context,
}

impl MockPilot {
    /// Connect a `DEALER` socket identified as `identity` to the
    /// orchestrator's `tcp://host:port` address.
    pub fn connect(identity: impl Into<String>, addr: &str) -> Result<Self, MockPilotError> {
        let identity = identity.into();
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::DEALER)?;
        socket.set_identity(identity.as_bytes())?;
        socket.set_rcvtimeo(DEFAULT_RECV_TIMEOUT_MS)?;
        socket.connect(addr)?;
        Ok(Self {
            ids: IdSequence::new(identity.clone()),
            identity,
            socket: Arc::new(Mutex::new(socket)),
            _ctx: ctx,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Build and transmit an envelope, returning its assigned `id` so the
    /// caller can match a later `CONFIRM`.
    pub async fn send(&self, to: &str, key: &str, value: Value) -> Result<String, MockPilotError> {
        let envelope = Envelope::new(self.identity.clone(), to, key, value, self.ids.next());
        let id = envelope.id.clone();
        let bytes = envelope.encode()?;
        let socket = Arc::clone(&self.socket);
        tokio::task::spawn_blocking(move || socket.lock().unwrap().send(bytes, 0))
            .await
            .expect("mock pilot send task panicked")?;
        Ok(id)
    }

    /// Block the receive, bounded by the socket's receive timeout (§5: a
    /// pilot that never reads simply times out; this mirrors that from the
    /// test's vantage point rather than hanging forever).
    pub async fn recv(&self) -> Result<Envelope, MockPilotError> {
        let socket = Arc::clone(&self.socket);
        let result = tokio::task::spawn_blocking(move || socket.lock().unwrap().recv_multipart(0))
            .await
            .expect("mock pilot recv task panicked");
        let frames = match result {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Err(MockPilotError::Timeout),
            Err(e) => return Err(MockPilotError::Zmq(e)),
        };
        let raw = frames.last().ok_or(MockPilotError::Timeout)?;
        Ok(Envelope::decode(raw)?)
    }

    /// Keep receiving until an envelope with `key` arrives, discarding
    /// anything else (e.g. `PING`). Returns `Timeout` if none arrives before
    /// the socket's receive timeout is hit while discarding.
    pub async fn recv_key(&self, key: &str) -> Result<Envelope, MockPilotError> {
        loop {
            let envelope = self.recv().await?;
            if envelope.key == key {
                return Ok(envelope);
            }
        }
    }

    /// Convenience for the `HANDSHAKE` verb (§6).
    pub async fn handshake(
        &self,
        to: &str,
        ip: &str,
        tasks: Vec<Value>,
    ) -> Result<String, MockPilotError> {
        self.send(
            to,
            "HANDSHAKE",
            serde_json::json!({ "pilot": self.identity, "ip": ip, "prefs": {}, "tasks": tasks }),
        )
        .await
    }

    /// Convenience for `INC_TRIAL_COUNTER` (§6).
    pub async fn inc_trial(&self, to: &str, subject: &str) -> Result<String, MockPilotError> {
        self.send(to, "INC_TRIAL_COUNTER", serde_json::json!({ "subject": subject }))
            .await
    }

    /// Convenience for `STATE` (§6): the payload is the opaque state string
    /// itself (e.g. `"IDLE"`), not an object wrapping one.
    pub async fn state(&self, to: &str, state_value: &str) -> Result<String, MockPilotError> {
        self.send(to, "STATE", Value::String(state_value.to_owned())).await
    }

    /// Convenience for `TASK_ERROR` (§6).
    pub async fn task_error(
        &self,
        to: &str,
        subject: &str,
        error_message: &str,
    ) -> Result<String, MockPilotError> {
        self.send(
            to,
            "TASK_ERROR",
            serde_json::json!({ "pilot": self.identity, "subject": subject, "error_message": error_message }),
        )
        .await
    }
}
