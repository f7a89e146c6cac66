//! Store health monitoring.
//!
//! A periodic probe writes a short-lived key; five consecutive failures flip
//! the health flag that the `/api/rate-limit/health/redis` endpoint exposes.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::core::store::StateStore;
use crate::utils;

/// Probe cadence.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive failures before the store is marked unhealthy.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// TTL of the probe key.
const PROBE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_success_ms: Option<i64>,
    pub last_failure_ms: Option<i64>,
}

pub struct HealthMonitor {
    store: Arc<dyn StateStore>,
    key: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_success_ms: AtomicI64,
    last_failure_ms: AtomicI64,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn StateStore>, key_prefix: &str) -> Self {
        Self {
            store,
            key: utils::health_check_key(key_prefix),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_success_ms: AtomicI64::new(0),
            last_failure_ms: AtomicI64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let success = self.last_success_ms.load(Ordering::Relaxed);
        let failure = self.last_failure_ms.load(Ordering::Relaxed);
        HealthSnapshot {
            healthy: self.is_healthy(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_success_ms: (success > 0).then_some(success),
            last_failure_ms: (failure > 0).then_some(failure),
        }
    }

    /// One probe cycle; called by the periodic task.
    pub async fn probe(&self) {
        let now = utils::current_millis() as i64;
        match self
            .store
            .set_with_ttl(&self.key, &now.to_string(), PROBE_TTL)
            .await
        {
            Ok(()) => self.on_success(now),
            Err(err) => self.on_failure(now, &err.to_string()),
        }
    }

    fn on_success(&self, now_ms: i64) {
        let was_unhealthy = !self.healthy.swap(true, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_ms.store(now_ms, Ordering::Relaxed);
        if was_unhealthy {
            info!("store connection recovered");
        } else {
            debug!("store health probe ok");
        }
    }

    fn on_failure(&self, now_ms: i64, error: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        warn!("store health probe failed ({} consecutive): {}", failures, error);

        if failures >= MAX_CONSECUTIVE_FAILURES && self.healthy.swap(false, Ordering::Relaxed) {
            error!("store marked unhealthy after {} consecutive failures", failures);
        }
    }
}
