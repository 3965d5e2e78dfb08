//! orch-protocol: wire types and codec for the pilot <-> orchestrator message bus.
//!
//! Every message on the wire is an [`Envelope`]. The codec is deliberately not
//! a closed `enum` over `key` the way a typical Rust wire protocol would be:
//! `spec.md` treats "unknown verbs on receive are logged and dropped" as a
//! runtime policy, not a compile-time one, so `key` stays an open `String`
//! validated against [`RESERVED_KEYS`] at the boundary instead of in the type
//! system.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Resend budget assigned to a freshly constructed envelope.
pub const DEFAULT_TTL: i32 = 3;

/// The flag carried by every `CONFIRM` envelope, and by any other envelope
/// that must never be resent (acks, and best-effort one-shot commands).
pub const NOREPEAT: &str = "NOREPEAT";

/// Verbs the codec accepts. Anything else is logged and dropped on receive.
pub const RESERVED_KEYS: &[&str] = &[
    "HANDSHAKE",
    "STATE",
    "PING",
    "DATA",
    "CONTINUOUS",
    "STREAM",
    "INC_TRIAL_COUNTER",
    "TASK_ERROR",
    "START",
    "STOP",
    "CONFIRM",
];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown verb `{0}`")]
    UnknownKey(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single message on the wire.
///
/// `id` is unique within the sender's lifetime and has the form
/// `{sender}_{monotonic counter}`. `CONFIRM` envelopes carry the confirmed
/// envelope's `id` as their `value` and always set [`NOREPEAT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub to: String,
    pub key: String,
    #[serde(default)]
    pub value: Value,
    pub id: String,
    #[serde(default)]
    pub flags: HashSet<String>,
    pub ttl: i32,
    pub timestamp: f64,
}

impl Envelope {
    /// Construct a new envelope, stamping `timestamp` and the default `ttl`.
    ///
    /// `id` must already be unique for `sender` (callers hold the monotonic
    /// counter, typically an [`IdSequence`]).
    pub fn new(
        sender: impl Into<String>,
        to: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        id: String,
    ) -> Self {
        Self {
            sender: sender.into(),
            to: to.into(),
            key: key.into(),
            value,
            id,
            flags: HashSet::new(),
            ttl: DEFAULT_TTL,
            timestamp: now_unix(),
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Build the `CONFIRM` reply for a received envelope: carries the
    /// confirmed `id` as `value`, and always bears `NOREPEAT`.
    pub fn confirm_for(&self, confirming_sender: impl Into<String>, id: String) -> Self {
        Envelope::new(
            confirming_sender,
            self.sender.clone(),
            "CONFIRM",
            Value::String(self.id.clone()),
            id,
        )
        .with_flag(NOREPEAT)
    }

    /// Validate required fields and the verb allowlist. Does not mutate.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.sender.is_empty() {
            return Err(CodecError::MissingField("sender"));
        }
        if self.to.is_empty() {
            return Err(CodecError::MissingField("to"));
        }
        if self.id.is_empty() {
            return Err(CodecError::MissingField("id"));
        }
        if !RESERVED_KEYS.contains(&self.key.as_str()) {
            return Err(CodecError::UnknownKey(self.key.clone()));
        }
        Ok(())
    }

    /// Serialize to the self-describing wire payload.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a wire payload in one step.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Per-sender monotonic ID allocator: `{sender}_{counter}`.
#[derive(Debug)]
pub struct IdSequence {
    sender: String,
    counter: std::sync::atomic::AtomicU64,
}

impl IdSequence {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}_{}", self.sender, n)
    }
}

// ---------------------------------------------------------------------------
// Typed payload helpers (keyed to the verbs in spec.md §6)
// ---------------------------------------------------------------------------

/// `HANDSHAKE` payload: `{pilot, ip, prefs, tasks}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    #[serde(default)]
    pub pilot: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub prefs: Value,
    #[serde(default)]
    pub tasks: Vec<Value>,
}

/// `DATA` / `CONTINUOUS` / `STREAM` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub subject: String,
    pub timestamp: f64,
    #[serde(default)]
    pub event: Value,
    /// Any additional fields the pilot sent, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// `INC_TRIAL_COUNTER` payload: `{subject}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncTrialPayload {
    pub subject: String,
}

/// `TASK_ERROR` payload: `{pilot, subject, error_message}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorPayload {
    #[serde(default)]
    pub pilot: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub error_message: String,
}

/// Recursively replace NaN/Infinity floats with `null` (the backend enforces
/// strict JSON). `serde_json::Value` has no tuple/set variant, so those are
/// already represented as arrays by the time they reach this function.
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(sanitize_json).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), sanitize_json(v))).collect())
        }
        other => other.clone(),
    }
}
