//! Sliding-window rate limiter.
//!
//! Resolves the applicable path rule for a request and asks the state store
//! to admit it. Store trouble never blocks traffic: infrastructure errors
//! produce an allowing decision tagged `ERROR`.

use std::sync::Arc;

use log::{debug, error, warn};

use crate::core::path_rules::PathRuleSnapshot;
use crate::core::store::StateStore;
use crate::utils;

/// Limit type carried by `ERROR` decisions when the store fails.
pub const LIMIT_TYPE_ERROR: &str = "ERROR";

/// Outcome of a limiter check for one `(ip, path)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit_type: String,
    /// Post-decision count when admitted, pre-decision count when rejected.
    pub current_count: Option<u32>,
    pub threshold: Option<u32>,
    pub window_size: Option<u64>,
}

impl RateLimitDecision {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            limit_type: LIMIT_TYPE_ERROR.to_string(),
            current_count: None,
            threshold: None,
            window_size: None,
        }
    }
}

pub struct SlidingWindowLimiter {
    store: Arc<dyn StateStore>,
    rules: Arc<PathRuleSnapshot>,
    key_prefix: String,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn StateStore>, rules: Arc<PathRuleSnapshot>, key_prefix: &str) -> Self {
        Self {
            store,
            rules,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Check one request against the rule matching its path.
    pub async fn check(&self, ip: &str, path: &str) -> RateLimitDecision {
        let rule = self.rules.current().resolve(path);
        let key = utils::sliding_window_key(&self.key_prefix, ip, path);
        let now_ms = utils::current_millis();
        let window_ms = rule.window_seconds * 1000;

        match self
            .store
            .sliding_window_admit(&key, now_ms, window_ms, rule.max_requests)
            .await
        {
            Ok(admission) => {
                let limit_type = limit_type_label(rule.window_seconds);
                if admission.admitted {
                    debug!(
                        "window admit - IP: {}, path: {}, count: {}/{}, window: {}s",
                        ip, path, admission.post_count, rule.max_requests, rule.window_seconds
                    );
                } else {
                    warn!(
                        "window reject - IP: {}, path: {}, count: {}/{}, window: {}s, type: {}",
                        ip, path, admission.pre_count, rule.max_requests, rule.window_seconds,
                        limit_type
                    );
                }
                RateLimitDecision {
                    allowed: admission.admitted,
                    limit_type: limit_type.to_string(),
                    current_count: Some(if admission.admitted {
                        admission.post_count
                    } else {
                        admission.pre_count
                    }),
                    threshold: Some(rule.max_requests),
                    window_size: Some(rule.window_seconds),
                }
            }
            Err(err) if err.is_infrastructure() => {
                error!(
                    "limiter store failure, admitting - IP: {}, path: {}, error: {}",
                    ip, path, err
                );
                RateLimitDecision::fail_open()
            }
            Err(err) => {
                error!(
                    "limiter backend error, admitting - IP: {}, path: {}, error: {}",
                    ip, path, err
                );
                RateLimitDecision::fail_open()
            }
        }
    }
}

/// Human-facing label for a window size; the classic one-second and
/// one-minute windows keep their historical names.
fn limit_type_label(window_seconds: u64) -> &'static str {
    match window_seconds {
        1 => "SECOND_LIMIT",
        60 => "MINUTE_LIMIT",
        _ => "IP_PATH_WINDOW",
    }
}
