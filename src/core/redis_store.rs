//! Redis state store back-end.
//!
//! Sliding windows are sorted sets with millisecond scores and uuid members;
//! the admit path runs as one Lua script so concurrent callers on the same
//! key serialize on the server. Every operation carries a short timeout and
//! transport errors get one retry with a small backoff.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::core::store::{StateStore, StoreError, WindowAdmission, WINDOW_TTL_SLACK};

/// Timeout for the atomic admit script.
const ADMIT_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeout for plain flag and set operations.
const SCALAR_TIMEOUT: Duration = Duration::from_millis(300);
/// Backoff before the single transport-error retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Admit script: evict, count, conditionally record and refresh the TTL.
/// Returns `{admitted(0/1), pre_count}`. Admission uses a strict `<` so the
/// budget is never exceeded.
const ADMIT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    redis.call('EXPIRE', KEYS[1], ARGV[5])
    return {1, count}
end
return {0, count}
"#;

pub struct RedisStore {
    client: redis::Client,
    admit_script: redis::Script,
}

fn classify(err: redis::RedisError) -> StoreError {
    // Per-call deadlines come from the tokio timeout wrapper; everything
    // I/O-shaped from the client is transport-class and may be retried.
    if err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.kind() == redis::ErrorKind::IoError
    {
        StoreError::Transport(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            admit_script: redis::Script::new(ADMIT_SCRIPT),
        }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client.get_async_connection().await.map_err(classify)
    }

    async fn admit_once(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u32,
    ) -> Result<WindowAdmission, StoreError> {
        let window_start = now_ms.saturating_sub(window_ms);
        let ttl_seconds = (window_ms + WINDOW_TTL_SLACK.as_millis() as u64 + 999) / 1000;
        let member = Uuid::new_v4().to_string();

        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .admit_script
            .key(key)
            .arg(window_start)
            .arg(max)
            .arg(now_ms)
            .arg(member)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        if reply.len() < 2 {
            return Err(StoreError::Backend(format!(
                "admit script returned {} values",
                reply.len()
            )));
        }

        let admitted = reply[0] == 1;
        let pre_count = reply[1].max(0) as u32;
        Ok(WindowAdmission {
            admitted,
            pre_count,
            post_count: if admitted { pre_count + 1 } else { pre_count },
        })
    }

    async fn record_observation_once(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<(), StoreError> {
        let window_start = now_ms.saturating_sub(window_ms);
        let ttl_seconds = (window_ms + WINDOW_TTL_SLACK.as_millis() as u64 + 999) / 1000;
        let member = Uuid::new_v4().to_string();

        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(window_start)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u32,
    ) -> Result<WindowAdmission, StoreError> {
        match with_timeout(ADMIT_TIMEOUT, self.admit_once(key, now_ms, window_ms, max)).await {
            Err(StoreError::Transport(first)) => {
                warn!("admit transport error, retrying once - key: {}, error: {}", key, first);
                tokio::time::sleep(RETRY_BACKOFF).await;
                with_timeout(ADMIT_TIMEOUT, self.admit_once(key, now_ms, window_ms, max)).await
            }
            other => other,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_timeout(SCALAR_TIMEOUT, async {
            let mut conn = self.connection().await?;
            conn.get::<_, Option<String>>(key).await.map_err(classify)
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        with_timeout(SCALAR_TIMEOUT, async {
            let mut conn = self.connection().await?;
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(classify)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        with_timeout(SCALAR_TIMEOUT, async {
            let mut conn = self.connection().await?;
            let removed: u64 = conn.del(key).await.map_err(classify)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        with_timeout(SCALAR_TIMEOUT, async {
            let mut conn = self.connection().await?;
            conn.exists::<_, bool>(key).await.map_err(classify)
        })
        .await
    }

    async fn record_observation(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<(), StoreError> {
        match with_timeout(ADMIT_TIMEOUT, self.record_observation_once(key, now_ms, window_ms)).await
        {
            Err(StoreError::Transport(first)) => {
                warn!(
                    "observation transport error, retrying once - key: {}, error: {}",
                    key, first
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
                with_timeout(ADMIT_TIMEOUT, self.record_observation_once(key, now_ms, window_ms))
                    .await
            }
            other => other,
        }
    }

    async fn count_active_sets(
        &self,
        key_prefix: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        let window_start = now_ms.saturating_sub(window_ms);
        with_timeout(ADMIT_TIMEOUT, async {
            let mut conn = self.connection().await?;
            let keys: Vec<String> = redis::cmd("KEYS")
                .arg(format!("{}*", key_prefix))
                .query_async(&mut conn)
                .await
                .map_err(classify)?;

            let mut active = 0u64;
            for key in keys {
                let surviving: u64 = redis::cmd("ZCOUNT")
                    .arg(&key)
                    .arg(format!("({}", window_start))
                    .arg(now_ms)
                    .query_async(&mut conn)
                    .await
                    .map_err(classify)?;
                if surviving > 0 {
                    active += 1;
                }
            }
            Ok(active)
        })
        .await
    }

    async fn purge_expired(&self, _now_ms: u64) -> Result<u64, StoreError> {
        // Keys expire server-side; nothing to sweep.
        Ok(0)
    }
}
