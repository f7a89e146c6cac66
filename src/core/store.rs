//! State store contract for the admission pipeline.
//!
//! All durable counters, lists and flags live behind the [`StateStore`]
//! trait so the pipeline can run against local memory on a single node or
//! against Redis in a distributed deployment. The sliding-window admit is
//! the one operation that must be atomic per key on every back-end.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a state store back-end.
///
/// `Timeout` and `Transport` are the infrastructure kinds; callers on the
/// request path degrade them to an admit decision rather than blocking
/// traffic on store trouble.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Infrastructure errors fail open; anything else is a bug surfaced loudly.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Transport(_))
    }
}

/// Outcome of a sliding-window admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub admitted: bool,
    /// Surviving entries before this request was considered.
    pub pre_count: u32,
    /// Entries after the decision; equals `pre_count` when rejected.
    pub post_count: u32,
}

/// Storage contract shared by the in-memory and Redis back-ends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomic sliding-window admit for one key.
    ///
    /// Evicts entries with timestamp <= `now_ms - window_ms`, counts the
    /// survivors, and appends `now_ms` iff the pre-append count is below
    /// `max`. The key carries a TTL of the window plus slack so orphaned
    /// windows self-destruct.
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u32,
    ) -> Result<WindowAdmission, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns true when a key existed and was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Record one observation in a window set (append, then evict entries
    /// older than the window). Used for the active-IP tracker.
    async fn record_observation(&self, key: &str, now_ms: u64, window_ms: u64)
        -> Result<(), StoreError>;

    /// Count keys under `key_prefix` that still hold at least one
    /// observation inside `(now_ms - window_ms, now_ms]`.
    async fn count_active_sets(
        &self,
        key_prefix: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, StoreError>;

    /// Drop expired windows and scalars. The Redis back-end relies on key
    /// TTLs and treats this as a no-op.
    async fn purge_expired(&self, now_ms: u64) -> Result<u64, StoreError>;
}

/// Extra slack added to window TTLs so a key outlives its last entry.
pub const WINDOW_TTL_SLACK: Duration = Duration::from_secs(1);
