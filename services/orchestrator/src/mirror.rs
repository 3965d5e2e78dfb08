//! Shared-State Mirror (§4.G): write-through replica of pilot connectivity
//! state into Redis, for external readers outside the orchestrator process.
//! Generalizes the original's direct `redis-py` client calls
//! (`orchestrator_station.py`'s `_redis_set_active_run`/`_redis_touch`)
//! behind a small trait so the orchestrator degrades to a no-op mirror when
//! `REDIS_URL` is unset, rather than branching on `Option<Client>` at every
//! call site.

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::warn;

use crate::domain::ActiveRun;

#[async_trait]
pub trait Mirror: Send + Sync {
    async fn set_state(&self, pilot: &str, state: &str);
    async fn set_active_run(&self, pilot: &str, run: Option<&ActiveRun>);
    /// Refreshes `updated_at` only, with no `state`/`active_run` write.
    /// Called on every pilot touch that isn't already a `set_state`/
    /// `set_active_run` (`HANDSHAKE`, `STATE`, `PING`), matching
    /// `orchestrator_station.py`'s `_redis_touch` (§4.G).
    async fn touch(&self, pilot: &str);
}

/// Selected when `Config::redis_url` is absent. All writes are dropped;
/// the orchestrator's own `PilotRegistry` remains the source of truth for
/// `GET /pilots/live` regardless of mirror availability.
pub struct NoopMirror;

#[async_trait]
impl Mirror for NoopMirror {
    async fn set_state(&self, _pilot: &str, _state: &str) {}
    async fn set_active_run(&self, _pilot: &str, _run: Option<&ActiveRun>) {}
    async fn touch(&self, _pilot: &str) {}
}

pub struct RedisMirror {
    client: redis::Client,
}

impl RedisMirror {
    pub fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }
}

#[async_trait]
impl Mirror for RedisMirror {
    /// Write-through of `state`/`updated_at` under `pilot:{identity}` (§3, §4.G).
    /// Failures are logged and otherwise ignored: the mirror is advisory and
    /// must never block a pilot state transition.
    async fn set_state(&self, pilot: &str, state: &str) {
        let key = format!("pilot:{pilot}");
        let result: redis::RedisResult<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.hset::<_, _, _, ()>(&key, "state", state).await?;
            conn.hset::<_, _, _, ()>(&key, "updated_at", Utc::now().to_rfc3339())
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(pilot, error = %e, "redis mirror set_state failed");
        }
    }

    /// Writes the JSON blob on `Some`, deletes the field on `None` (a pilot
    /// going idle clears its active run from the mirror rather than leaving
    /// a stale value behind).
    async fn set_active_run(&self, pilot: &str, run: Option<&ActiveRun>) {
        let key = format!("pilot:{pilot}");
        let result: redis::RedisResult<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            match run {
                Some(run) => {
                    let blob = serde_json::to_string(run).unwrap_or_default();
                    conn.hset::<_, _, _, ()>(&key, "active_run", blob).await?;
                }
                None => {
                    conn.hdel::<_, _, ()>(&key, "active_run").await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(pilot, error = %e, "redis mirror set_active_run failed");
        }
    }

    /// `orchestrator_station.py`'s `_redis_touch`: refresh `updated_at` alone,
    /// called from the `HANDSHAKE`/`STATE`/`PING` handlers so every pilot
    /// touch keeps the mirror's staleness clock current, not just the
    /// transitions that also change `state`/`active_run`.
    async fn touch(&self, pilot: &str) {
        let key = format!("pilot:{pilot}");
        let result: redis::RedisResult<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.hset::<_, _, _, ()>(&key, "updated_at", Utc::now().to_rfc3339())
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(pilot, error = %e, "redis mirror touch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_mirror_accepts_all_writes_without_panicking() {
        let mirror = NoopMirror;
        mirror.set_state("alpha", "IDLE").await;
        mirror.set_active_run("alpha", None).await;
        mirror.touch("alpha").await;
    }
}
