//! Process configuration, loaded from the environment (§6).
//!
//! Mirrors the teacher's `env::var(...).unwrap_or_else` style in `main.rs`
//! rather than the original Python's JSON-file `Config` class: the teacher's
//! convention is environment variables, and the ambient-stack rule follows
//! the teacher's idiom on non-functional concerns.

use std::env;
use std::time::Duration;

/// Required and optional configuration, plus every internal constant §6
/// allows an implementer to override.
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator identity string (`NAME`).
    pub name: String,
    /// Transport listen port (`MSGPORT`).
    pub msg_port: u16,
    /// Backend base URL (`MICS_API_URL`).
    pub backend_url: String,
    /// Backend bearer JWT (`MICS_API_TOKEN`).
    pub backend_token: String,
    /// KV mirror URL (`REDIS_URL`); mirror is a no-op when absent.
    pub redis_url: Option<String>,
    /// Elasticsearch sink base URL; defaults to the original's hardcoded
    /// dev host when unset, since `spec.md` does not enumerate a config key
    /// for it but §4.E requires a sink client to exist.
    pub sink_url: String,
    /// Tracing env-filter directive (`LOGLEVEL`).
    pub log_level: String,

    pub resend_interval: Duration,
    pub ping_interval: Duration,
    pub wait_idle_timeout: Duration,
    pub hardware_release_interval: Duration,
    pub sink_request_timeout: Duration,
    pub queue_capacity: usize,
    pub data_workers: usize,

    /// Opt-in watchdog (§4.J, §9 Open Question): force-errors a run stuck in
    /// `running` for longer than `watchdog_stuck_threshold`.
    pub watchdog_enabled: bool,
    pub watchdog_poll_interval: Duration,
    pub watchdog_stuck_threshold: Duration,

    /// Bind address for the Control API (not an original config key; the
    /// original ran FastAPI via an external ASGI server argument).
    pub control_api_bind_addr: String,
}

impl Config {
    /// Load from the process environment, applying the spec's defaults for
    /// every optional key. Panics with a descriptive message on a missing
    /// required key, matching the original's `Config.require`.
    pub fn from_env() -> Self {
        Self {
            name: require_env("NAME"),
            msg_port: require_env("MSGPORT")
                .parse()
                .expect("MSGPORT must be a valid port number"),
            backend_url: require_env("MICS_API_URL"),
            backend_token: require_env("MICS_API_TOKEN"),
            redis_url: env::var("REDIS_URL").ok(),
            sink_url: env::var("SINK_URL")
                .unwrap_or_else(|_| "http://localhost:9200".to_owned()),
            log_level: env::var("LOGLEVEL").unwrap_or_else(|_| "info".to_owned()),

            resend_interval: secs_from_env("RESEND_INTERVAL_SECS", 5),
            ping_interval: secs_from_env("PING_INTERVAL_SECS", 10),
            wait_idle_timeout: secs_from_env("WAIT_IDLE_TIMEOUT_SECS", 15),
            hardware_release_interval: secs_from_env("HARDWARE_RELEASE_INTERVAL_SECS", 10),
            sink_request_timeout: secs_from_env("SINK_REQUEST_TIMEOUT_SECS", 2),
            queue_capacity: usize_from_env("QUEUE_CAPACITY", 50_000),
            data_workers: usize_from_env("DATA_WORKERS", 4),

            watchdog_enabled: env::var("WATCHDOG_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            watchdog_poll_interval: secs_from_env("WATCHDOG_POLL_INTERVAL_SECS", 5),
            watchdog_stuck_threshold: secs_from_env("WATCHDOG_STUCK_THRESHOLD_SECS", 30),

            control_api_bind_addr: env::var("CONTROL_API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8000".to_owned()),
        }
    }
}

fn require_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("missing required config key: {key}"))
}

fn secs_from_env(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(usize_from_env(key, default_secs as usize) as u64)
}

fn usize_from_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn from_env_applies_defaults_for_optional_keys() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "NAME",
            "MSGPORT",
            "MICS_API_URL",
            "MICS_API_TOKEN",
            "REDIS_URL",
            "WATCHDOG_ENABLED",
        ] {
            env::remove_var(key);
        }
        env::set_var("NAME", "orch");
        env::set_var("MSGPORT", "5555");
        env::set_var("MICS_API_URL", "http://backend.local");
        env::set_var("MICS_API_TOKEN", "test-token");

        let config = Config::from_env();
        assert_eq!(config.name, "orch");
        assert_eq!(config.msg_port, 5555);
        assert!(config.redis_url.is_none());
        assert!(!config.watchdog_enabled);
        assert_eq!(config.resend_interval, Duration::from_secs(5));
        assert_eq!(config.data_workers, 4);

        for key in ["NAME", "MSGPORT", "MICS_API_URL", "MICS_API_TOKEN"] {
            env::remove_var(key);
        }
    }
}
