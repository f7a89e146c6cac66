//! In-memory state store back-end.
//!
//! Keeps every sliding window as a deque of millisecond timestamps and every
//! scalar flag with an absolute expiry instant. Suitable for single-node
//! deployments; the per-key mutexes give the same admit atomicity the Redis
//! script guarantees remotely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;

use crate::core::store::{StateStore, StoreError, WindowAdmission, WINDOW_TTL_SLACK};

#[derive(Debug)]
struct WindowEntry {
    timestamps: Vec<u64>,
    /// Millisecond deadline after which the whole window is garbage.
    expires_at_ms: u64,
}

#[derive(Debug, Clone)]
struct ScalarEntry {
    value: String,
    expires_at: Instant,
}

/// Single-process [`StateStore`] implementation.
pub struct MemoryStore {
    windows: RwLock<HashMap<String, Arc<Mutex<WindowEntry>>>>,
    scalars: Mutex<HashMap<String, ScalarEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            scalars: Mutex::new(HashMap::new()),
        }
    }

    fn window_handle(&self, key: &str, now_ms: u64) -> Arc<Mutex<WindowEntry>> {
        if let Some(entry) = self.windows.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return Arc::clone(entry);
        }
        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(windows.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(WindowEntry {
                timestamps: Vec::new(),
                expires_at_ms: now_ms,
            }))
        }))
    }

    fn evict(entry: &mut WindowEntry, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        // Timestamps are appended in order; trim from the front.
        let keep_from = entry.timestamps.partition_point(|&t| t <= cutoff);
        if keep_from > 0 {
            entry.timestamps.drain(..keep_from);
        }
    }

    fn scalar_get(&self, key: &str) -> Option<String> {
        let mut scalars = self.scalars.lock().unwrap_or_else(|e| e.into_inner());
        match scalars.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                scalars.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max: u32,
    ) -> Result<WindowAdmission, StoreError> {
        let handle = self.window_handle(key, now_ms);
        let mut entry = handle.lock().unwrap_or_else(|e| e.into_inner());

        Self::evict(&mut entry, now_ms, window_ms);
        let pre_count = entry.timestamps.len() as u32;

        if pre_count < max {
            entry.timestamps.push(now_ms);
            entry.expires_at_ms = now_ms + window_ms + WINDOW_TTL_SLACK.as_millis() as u64;
            Ok(WindowAdmission {
                admitted: true,
                pre_count,
                post_count: pre_count + 1,
            })
        } else {
            Ok(WindowAdmission {
                admitted: false,
                pre_count,
                post_count: pre_count,
            })
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.scalar_get(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut scalars = self.scalars.lock().unwrap_or_else(|e| e.into_inner());
        scalars.insert(
            key.to_string(),
            ScalarEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut scalars = self.scalars.lock().unwrap_or_else(|e| e.into_inner());
        match scalars.remove(key) {
            Some(entry) => Ok(entry.expires_at > Instant::now()),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.scalar_get(key).is_some())
    }

    async fn record_observation(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<(), StoreError> {
        let handle = self.window_handle(key, now_ms);
        let mut entry = handle.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut entry, now_ms, window_ms);
        entry.timestamps.push(now_ms);
        entry.expires_at_ms = now_ms + window_ms + WINDOW_TTL_SLACK.as_millis() as u64;
        Ok(())
    }

    async fn count_active_sets(
        &self,
        key_prefix: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        let cutoff = now_ms.saturating_sub(window_ms);
        let windows = self.windows.read().unwrap_or_else(|e| e.into_inner());
        let mut count = 0u64;
        for (key, handle) in windows.iter() {
            if !key.starts_with(key_prefix) {
                continue;
            }
            let entry = handle.lock().unwrap_or_else(|e| e.into_inner());
            if entry.timestamps.iter().any(|&t| t > cutoff && t <= now_ms) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        {
            let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
            windows.retain(|_, handle| {
                let entry = handle.lock().unwrap_or_else(|e| e.into_inner());
                let live = entry.expires_at_ms > now_ms && !entry.timestamps.is_empty();
                if !live {
                    removed += 1;
                }
                live
            });
        }
        {
            let now = Instant::now();
            let mut scalars = self.scalars.lock().unwrap_or_else(|e| e.into_inner());
            scalars.retain(|_, entry| {
                let live = entry.expires_at > now;
                if !live {
                    removed += 1;
                }
                live
            });
        }
        debug!("memory store purge removed {} entries", removed);
        Ok(removed)
    }
}
