//! Background maintenance tasks.
//!
//! Periodic sweepers keep the stores tidy and drive the CAPTCHA-mode
//! release side of the hysteresis without waiting for request traffic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use log::{error, info};
use tokio::task::JoinHandle;

use crate::core::abuse::AbuseStateMachine;
use crate::core::audit::AuditStore;
use crate::core::health::{HealthMonitor, HEALTH_CHECK_INTERVAL};
use crate::core::store::StateStore;
use crate::utils;

/// Expired sliding-window record cleanup cadence.
const WINDOW_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// CAPTCHA-mode hysteresis check cadence.
const CAPTCHA_RELEASE_INTERVAL: Duration = Duration::from_secs(30);
/// Hourly retention catch-up cadence.
const RETENTION_CATCHUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Hour (UTC) of the daily retention sweep.
const RETENTION_DAILY_HOUR: u32 = 2;

pub fn spawn_health_probe(monitor: Arc<HealthMonitor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            monitor.probe().await;
        }
    })
}

pub fn spawn_captcha_release(abuse: Arc<AbuseStateMachine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CAPTCHA_RELEASE_INTERVAL);
        loop {
            ticker.tick().await;
            abuse.release_captcha_if_quiet().await;
        }
    })
}

pub fn spawn_window_cleanup(store: Arc<dyn StateStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WINDOW_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            match store.purge_expired(utils::current_millis()).await {
                Ok(removed) if removed > 0 => {
                    info!("window cleanup removed {} expired entries", removed)
                }
                Ok(_) => {}
                Err(err) => error!("window cleanup failed: {}", err),
            }
        }
    })
}

/// Daily retention sweep at 02:00 plus an hourly catch-up one day beyond the
/// retention horizon.
pub fn spawn_audit_retention(store: Arc<dyn AuditStore>, retention_days: i64) -> Vec<JoinHandle<()>> {
    let daily_store = Arc::clone(&store);
    let daily = tokio::spawn(async move {
        loop {
            tokio::time::sleep(until_next_daily_run(RETENTION_DAILY_HOUR)).await;
            let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).timestamp_millis();
            match daily_store.evict_older_than(cutoff).await {
                Ok(evicted) => info!(
                    "daily audit retention removed {} records older than {} days",
                    evicted, retention_days
                ),
                Err(err) => error!("daily audit retention failed: {}", err),
            }
        }
    });

    let hourly = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_CATCHUP_INTERVAL);
        loop {
            ticker.tick().await;
            let cutoff =
                (Utc::now() - chrono::Duration::days(retention_days + 1)).timestamp_millis();
            match store.evict_older_than(cutoff).await {
                Ok(evicted) if evicted > 0 => {
                    info!("hourly audit catch-up removed {} records", evicted)
                }
                Ok(_) => {}
                Err(err) => error!("hourly audit catch-up failed: {}", err),
            }
        }
    });

    vec![daily, hourly]
}

/// Time left until the next daily run at `hour:00:00` UTC.
fn until_next_daily_run(hour: u32) -> Duration {
    let now = Utc::now();
    let mut next = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or(RETENTION_CATCHUP_INTERVAL)
}
