//! Abuse state machine.
//!
//! Couples the per-IP whitelist and blacklist, the global CAPTCHA-required
//! flag and the active-IP tracker into one admission verdict per request.
//! Every store failure during evaluation collapses to an admit so the
//! pipeline never blocks traffic on infrastructure trouble.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::core::limiter::{RateLimitDecision, SlidingWindowLimiter};
use crate::core::path_rules::path_matches;
use crate::core::store::StateStore;
use crate::models::{CaptchaConfig, RateLimitConfig};
use crate::utils;

pub const LIMIT_TYPE_BLACKLIST: &str = "BLACKLIST_BLOCKED";
pub const LIMIT_TYPE_DDOS_THRESHOLD: &str = "DDOS_THRESHOLD";
pub const LIMIT_TYPE_DDOS_PROTECTION: &str = "DDOS_PROTECTION";

pub const BLACKLIST_REASON_CAPTCHA_ACTIVE: &str = "CAPTCHA_ACTIVE";

/// Final verdict of the IP-level evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// Admit, but tell the caller the decision was relaxed (non-strict API
    /// traffic during CAPTCHA mode).
    AdmitWithAdvisory(String),
    /// Send the client to the CAPTCHA challenge.
    Challenge { limit_type: String },
}

/// Evaluation outcome plus the facts the attribute bus records.
#[derive(Debug, Clone)]
pub struct IpEvaluation {
    pub verdict: Verdict,
    pub in_whitelist: bool,
    pub in_blacklist: bool,
    pub blacklist_info: Option<String>,
}

pub struct AbuseStateMachine {
    store: Arc<dyn StateStore>,
    limiter: Arc<SlidingWindowLimiter>,
    config: RateLimitConfig,
    captcha: CaptchaConfig,
}

impl AbuseStateMachine {
    pub fn new(
        store: Arc<dyn StateStore>,
        limiter: Arc<SlidingWindowLimiter>,
        config: RateLimitConfig,
        captcha: CaptchaConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            config,
            captcha,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_skip_path(&self, path: &str) -> bool {
        self.config
            .skip_paths
            .iter()
            .any(|pattern| path_matches(pattern, path) || pattern == path)
    }

    pub fn is_api_request(&self, path: &str) -> bool {
        self.captcha
            .api_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// IP-level evaluation: whitelist, blacklist, active-IP tracking and the
    /// DDoS hysteresis, in that order. First match wins.
    pub async fn evaluate_ip(&self, ip: &str, is_api_request: bool) -> IpEvaluation {
        if self.is_in_white_list(ip).await {
            debug!("whitelisted, admitting - IP: {}", ip);
            return IpEvaluation {
                verdict: Verdict::Admit,
                in_whitelist: true,
                in_blacklist: false,
                blacklist_info: None,
            };
        }

        if self.is_in_black_list(ip).await {
            let info = self.black_list_info(ip).await;
            warn!("blacklisted, challenging - IP: {}, info: {:?}", ip, info);
            return IpEvaluation {
                verdict: Verdict::Challenge {
                    limit_type: LIMIT_TYPE_BLACKLIST.to_string(),
                },
                in_whitelist: false,
                in_blacklist: true,
                blacklist_info: info,
            };
        }

        self.record_ip_access(ip).await;

        let verdict = self.evaluate_ddos_state(ip, is_api_request).await;
        IpEvaluation {
            verdict,
            in_whitelist: false,
            in_blacklist: false,
            blacklist_info: None,
        }
    }

    /// Hysteresis over the active-IP count.
    async fn evaluate_ddos_state(&self, ip: &str, is_api_request: bool) -> Verdict {
        let active_ips = self.active_ip_count().await;

        if self.is_captcha_required().await {
            if active_ips <= self.config.ddos_release_ip_count {
                info!(
                    "active IPs fell to {}, releasing CAPTCHA mode (release threshold {})",
                    active_ips, self.config.ddos_release_ip_count
                );
                self.disable_captcha_required().await;
                return Verdict::Admit;
            }

            if !self.captcha.strict_mode
                && is_api_request
                && self.captcha.allow_api_when_captcha_active
            {
                debug!("CAPTCHA mode active but relaxed for API traffic - IP: {}", ip);
                return Verdict::AdmitWithAdvisory(
                    "captcha-mode-active; admitted by relaxed policy".to_string(),
                );
            }

            info!(
                "CAPTCHA mode active, challenging - IP: {}, active IPs: {}",
                ip, active_ips
            );
            self.add_to_black_list_if_enabled(ip, BLACKLIST_REASON_CAPTCHA_ACTIVE).await;
            return Verdict::Challenge {
                limit_type: LIMIT_TYPE_DDOS_PROTECTION.to_string(),
            };
        }

        if active_ips >= self.config.ddos_threshold_ip_count {
            warn!(
                "volumetric surge detected, engaging CAPTCHA mode - active IPs: {}, threshold: {}, IP: {}",
                active_ips, self.config.ddos_threshold_ip_count, ip
            );
            self.enable_captcha_required().await;
            self.add_to_black_list_if_enabled(ip, LIMIT_TYPE_DDOS_THRESHOLD).await;
            return Verdict::Challenge {
                limit_type: LIMIT_TYPE_DDOS_THRESHOLD.to_string(),
            };
        }

        Verdict::Admit
    }

    /// Per-path budget enforcement: run the sliding-window limiter and
    /// blacklist the IP when it trips (if auto-blacklisting is enabled).
    pub async fn enforce_path_budget(&self, ip: &str, path: &str) -> RateLimitDecision {
        let decision = self.limiter.check(ip, path).await;
        if !decision.allowed {
            let reason = format!("IP_RATE_LIMIT:{}", decision.limit_type);
            self.add_to_black_list_if_enabled(ip, &reason).await;
        }
        decision
    }

    // ---- whitelist ----

    pub async fn is_in_white_list(&self, ip: &str) -> bool {
        let key = utils::white_list_key(&self.config.redis_key_prefix, ip);
        match self.store.exists(&key).await {
            Ok(present) => present,
            Err(err) => {
                error!("whitelist check failed, assuming absent - IP: {}, error: {}", ip, err);
                false
            }
        }
    }

    pub async fn add_to_white_list(&self, ip: &str) -> bool {
        let key = utils::white_list_key(&self.config.redis_key_prefix, ip);
        let ttl = Duration::from_secs(self.config.white_list_duration_minutes * 60);
        match self.store.set_with_ttl(&key, ip, ttl).await {
            Ok(()) => {
                info!(
                    "IP added to whitelist - IP: {}, ttl: {} min",
                    ip, self.config.white_list_duration_minutes
                );
                true
            }
            Err(err) => {
                error!("whitelist insert failed - IP: {}, error: {}", ip, err);
                false
            }
        }
    }

    pub async fn remove_from_white_list(&self, ip: &str) -> bool {
        let key = utils::white_list_key(&self.config.redis_key_prefix, ip);
        match self.store.delete(&key).await {
            Ok(removed) => removed,
            Err(err) => {
                error!("whitelist removal failed - IP: {}, error: {}", ip, err);
                false
            }
        }
    }

    // ---- blacklist ----

    pub async fn is_in_black_list(&self, ip: &str) -> bool {
        let key = utils::black_list_key(&self.config.redis_key_prefix, ip);
        match self.store.exists(&key).await {
            Ok(present) => present,
            Err(err) => {
                error!("blacklist check failed, assuming absent - IP: {}, error: {}", ip, err);
                false
            }
        }
    }

    pub async fn add_to_black_list(&self, ip: &str, reason: &str, duration_minutes: u64) -> bool {
        let key = utils::black_list_key(&self.config.redis_key_prefix, ip);
        let value = format!("reason:{},timestamp:{}", reason, utils::current_millis());
        match self
            .store
            .set_with_ttl(&key, &value, Duration::from_secs(duration_minutes * 60))
            .await
        {
            Ok(()) => {
                warn!(
                    "IP added to blacklist - IP: {}, reason: {}, ttl: {} min",
                    ip, reason, duration_minutes
                );
                true
            }
            Err(err) => {
                error!("blacklist insert failed - IP: {}, error: {}", ip, err);
                false
            }
        }
    }

    pub async fn remove_from_black_list(&self, ip: &str) -> bool {
        let key = utils::black_list_key(&self.config.redis_key_prefix, ip);
        match self.store.delete(&key).await {
            Ok(removed) => {
                if removed {
                    info!("IP removed from blacklist - IP: {}", ip);
                }
                removed
            }
            Err(err) => {
                error!("blacklist removal failed - IP: {}, error: {}", ip, err);
                false
            }
        }
    }

    pub async fn black_list_info(&self, ip: &str) -> Option<String> {
        let key = utils::black_list_key(&self.config.redis_key_prefix, ip);
        match self.store.get(&key).await {
            Ok(info) => info,
            Err(err) => {
                error!("blacklist info lookup failed - IP: {}, error: {}", ip, err);
                None
            }
        }
    }

    async fn add_to_black_list_if_enabled(&self, ip: &str, reason: &str) {
        if !self.config.black_list_enabled {
            debug!("auto-blacklisting disabled, skipping - IP: {}", ip);
            return;
        }
        self.add_to_black_list(ip, reason, self.config.black_list_duration_minutes)
            .await;
    }

    // ---- global CAPTCHA flag ----

    pub async fn is_captcha_required(&self) -> bool {
        let key = utils::captcha_required_key(&self.config.redis_key_prefix);
        match self.store.exists(&key).await {
            Ok(required) => required,
            Err(err) => {
                error!("captcha-required check failed, assuming off - error: {}", err);
                false
            }
        }
    }

    pub async fn enable_captcha_required(&self) -> bool {
        let key = utils::captcha_required_key(&self.config.redis_key_prefix);
        let ttl = Duration::from_secs(self.config.captcha_duration_minutes * 60);
        match self.store.set_with_ttl(&key, "true", ttl).await {
            Ok(()) => true,
            Err(err) => {
                error!("enabling captcha mode failed - error: {}", err);
                false
            }
        }
    }

    pub async fn disable_captcha_required(&self) -> bool {
        let key = utils::captcha_required_key(&self.config.redis_key_prefix);
        match self.store.delete(&key).await {
            Ok(removed) => removed,
            Err(err) => {
                error!("disabling captcha mode failed - error: {}", err);
                false
            }
        }
    }

    // ---- active-IP tracking ----

    pub async fn record_ip_access(&self, ip: &str) {
        let key = utils::ip_access_key(&self.config.redis_key_prefix, ip);
        let window_ms = self.config.ip_track_duration_seconds * 1000;
        if let Err(err) = self
            .store
            .record_observation(&key, utils::current_millis(), window_ms)
            .await
        {
            error!("recording IP access failed - IP: {}, error: {}", ip, err);
        }
    }

    pub async fn active_ip_count(&self) -> u64 {
        let prefix = utils::ip_access_scan_prefix(&self.config.redis_key_prefix);
        let window_ms = self.config.ip_track_duration_seconds * 1000;
        match self
            .store
            .count_active_sets(&prefix, utils::current_millis(), window_ms)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                error!("active IP count failed, assuming 0 - error: {}", err);
                0
            }
        }
    }

    /// Release CAPTCHA mode when the active-IP count has decayed below the
    /// release threshold. Driven by the periodic sweeper.
    pub async fn release_captcha_if_quiet(&self) -> bool {
        if !self.config.enabled || !self.is_captcha_required().await {
            return false;
        }
        let active_ips = self.active_ip_count().await;
        if active_ips <= self.config.ddos_release_ip_count {
            info!(
                "sweeper releasing CAPTCHA mode - active IPs: {}, release threshold: {}",
                active_ips, self.config.ddos_release_ip_count
            );
            self.disable_captcha_required().await
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_store::MemoryStore;
    use crate::core::path_rules::PathRuleSnapshot;
    use crate::core::store::{StoreError, WindowAdmission};
    use crate::models::SlidingWindowConfig;
    use async_trait::async_trait;

    fn rate_limit_config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            storage_type: "LOCAL_MEMORY".to_string(),
            redis_key_prefix: "rate_limit".to_string(),
            sliding_window: SlidingWindowConfig {
                default_window_size: 1,
                default_max_requests: 2,
                path_rules: vec![],
            },
            ddos_threshold_ip_count: 5,
            ddos_release_ip_count: 2,
            ip_track_duration_seconds: 10,
            white_list_duration_minutes: 5,
            black_list_duration_minutes: 30,
            captcha_duration_minutes: 5,
            black_list_enabled: true,
            skip_paths: vec!["/static/captcha.html".to_string(), "/actuator/**".to_string()],
            captcha_page_path: "/static/captcha.html".to_string(),
            base_url: String::new(),
            verbose_logging: false,
        }
    }

    fn captcha_config(strict: bool) -> CaptchaConfig {
        CaptchaConfig {
            strict_mode: strict,
            allow_api_when_captcha_active: true,
            api_path_prefixes: vec!["/api/".to_string()],
        }
    }

    fn machine_with(
        store: Arc<dyn StateStore>,
        config: RateLimitConfig,
        captcha: CaptchaConfig,
    ) -> AbuseStateMachine {
        let rules = Arc::new(PathRuleSnapshot::new(&config.sliding_window));
        let limiter = Arc::new(SlidingWindowLimiter::new(
            Arc::clone(&store),
            rules,
            &config.redis_key_prefix,
        ));
        AbuseStateMachine::new(store, limiter, config, captcha)
    }

    fn machine() -> AbuseStateMachine {
        machine_with(
            Arc::new(MemoryStore::new()),
            rate_limit_config(),
            captcha_config(false),
        )
    }

    #[tokio::test]
    async fn skip_paths_match_patterns_and_literals() {
        let machine = machine();
        assert!(machine.is_skip_path("/static/captcha.html"));
        assert!(machine.is_skip_path("/actuator/health"));
        assert!(!machine.is_skip_path("/api/users"));
    }

    #[tokio::test]
    async fn whitelisted_ip_is_admitted_without_counting() {
        let machine = machine();
        machine.add_to_white_list("4.4.4.4").await;

        let eval = machine.evaluate_ip("4.4.4.4", false).await;
        assert_eq!(eval.verdict, Verdict::Admit);
        assert!(eval.in_whitelist);
        // The whitelist path returns before the active-set is touched.
        assert_eq!(machine.active_ip_count().await, 0);
    }

    #[tokio::test]
    async fn blacklisted_ip_is_challenged_with_info() {
        let machine = machine();
        machine.add_to_black_list("5.5.5.5", "manual", 30).await;

        let eval = machine.evaluate_ip("5.5.5.5", false).await;
        assert_eq!(
            eval.verdict,
            Verdict::Challenge { limit_type: LIMIT_TYPE_BLACKLIST.to_string() }
        );
        assert!(eval.in_blacklist);
        let info = eval.blacklist_info.unwrap();
        assert!(info.starts_with("reason:manual,timestamp:"));
    }

    #[tokio::test]
    async fn quiet_traffic_is_admitted_and_tracked() {
        let machine = machine();
        let eval = machine.evaluate_ip("6.6.6.6", false).await;
        assert_eq!(eval.verdict, Verdict::Admit);
        assert_eq!(machine.active_ip_count().await, 1);
    }

    #[tokio::test]
    async fn surge_engages_captcha_mode_and_blacklists_the_ip() {
        let machine = machine();
        // Four distinct IPs already active; the fifth crosses the threshold.
        for i in 0..4 {
            machine.record_ip_access(&format!("10.0.0.{}", i)).await;
        }

        let eval = machine.evaluate_ip("10.0.0.9", false).await;
        assert_eq!(
            eval.verdict,
            Verdict::Challenge { limit_type: LIMIT_TYPE_DDOS_THRESHOLD.to_string() }
        );
        assert!(machine.is_captcha_required().await);
        assert!(machine.is_in_black_list("10.0.0.9").await);
        let info = machine.black_list_info("10.0.0.9").await.unwrap();
        assert!(info.contains("DDOS_THRESHOLD"));
    }

    #[tokio::test]
    async fn captcha_mode_releases_below_the_lower_threshold() {
        let machine = machine();
        machine.enable_captcha_required().await;

        // Only this one IP is active, which is at most the release threshold.
        let eval = machine.evaluate_ip("7.7.7.7", false).await;
        assert_eq!(eval.verdict, Verdict::Admit);
        assert!(!machine.is_captcha_required().await);
    }

    #[tokio::test]
    async fn captcha_mode_challenges_in_the_hysteresis_band() {
        let machine = machine();
        machine.enable_captcha_required().await;
        for i in 0..3 {
            machine.record_ip_access(&format!("11.0.0.{}", i)).await;
        }

        let eval = machine.evaluate_ip("11.0.0.9", false).await;
        assert_eq!(
            eval.verdict,
            Verdict::Challenge { limit_type: LIMIT_TYPE_DDOS_PROTECTION.to_string() }
        );
        // The mode did not toggle.
        assert!(machine.is_captcha_required().await);
        let info = machine.black_list_info("11.0.0.9").await.unwrap();
        assert!(info.contains(BLACKLIST_REASON_CAPTCHA_ACTIVE));
    }

    #[tokio::test]
    async fn relaxed_mode_admits_api_traffic_with_advisory() {
        let machine = machine();
        machine.enable_captcha_required().await;
        for i in 0..3 {
            machine.record_ip_access(&format!("12.0.0.{}", i)).await;
        }

        let eval = machine.evaluate_ip("12.0.0.9", true).await;
        assert!(matches!(eval.verdict, Verdict::AdmitWithAdvisory(_)));
        assert!(!machine.is_in_black_list("12.0.0.9").await);
    }

    #[tokio::test]
    async fn strict_mode_challenges_api_traffic_too() {
        let machine = machine_with(
            Arc::new(MemoryStore::new()),
            rate_limit_config(),
            captcha_config(true),
        );
        machine.enable_captcha_required().await;
        for i in 0..3 {
            machine.record_ip_access(&format!("13.0.0.{}", i)).await;
        }

        let eval = machine.evaluate_ip("13.0.0.9", true).await;
        assert_eq!(
            eval.verdict,
            Verdict::Challenge { limit_type: LIMIT_TYPE_DDOS_PROTECTION.to_string() }
        );
    }

    #[tokio::test]
    async fn path_budget_trip_blacklists_the_ip() {
        let machine = machine();
        assert!(machine.enforce_path_budget("14.0.0.1", "/a").await.allowed);
        assert!(machine.enforce_path_budget("14.0.0.1", "/a").await.allowed);

        let tripped = machine.enforce_path_budget("14.0.0.1", "/a").await;
        assert!(!tripped.allowed);
        assert!(machine.is_in_black_list("14.0.0.1").await);
        let info = machine.black_list_info("14.0.0.1").await.unwrap();
        assert!(info.contains("IP_RATE_LIMIT:SECOND_LIMIT"));
    }

    #[tokio::test]
    async fn disabled_blacklist_keeps_lists_untouched() {
        let mut config = rate_limit_config();
        config.black_list_enabled = false;
        let machine = machine_with(Arc::new(MemoryStore::new()), config, captcha_config(false));

        machine.enforce_path_budget("15.0.0.1", "/a").await;
        machine.enforce_path_budget("15.0.0.1", "/a").await;
        let tripped = machine.enforce_path_budget("15.0.0.1", "/a").await;
        assert!(!tripped.allowed);
        assert!(!machine.is_in_black_list("15.0.0.1").await);
    }

    #[tokio::test]
    async fn blacklist_roundtrip_law() {
        let machine = machine();
        machine.add_to_black_list("16.0.0.1", "r", 30).await;
        machine.remove_from_black_list("16.0.0.1").await;
        assert!(!machine.is_in_black_list("16.0.0.1").await);
    }

    #[tokio::test]
    async fn sweeper_release_respects_the_band() {
        let machine = machine();
        machine.enable_captcha_required().await;
        for i in 0..3 {
            machine.record_ip_access(&format!("17.0.0.{}", i)).await;
        }
        // Three active IPs sit above the release threshold of two.
        assert!(!machine.release_captcha_if_quiet().await);
        assert!(machine.is_captcha_required().await);
    }

    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        async fn sliding_window_admit(
            &self,
            _key: &str,
            _now_ms: u64,
            _window_ms: u64,
            _max: u32,
        ) -> Result<WindowAdmission, StoreError> {
            Err(StoreError::Timeout)
        }
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Timeout)
        }
        async fn set_with_ttl(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<(), StoreError> {
            Err(StoreError::Timeout)
        }
        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Timeout)
        }
        async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Timeout)
        }
        async fn record_observation(
            &self,
            _key: &str,
            _now_ms: u64,
            _window_ms: u64,
        ) -> Result<(), StoreError> {
            Err(StoreError::Timeout)
        }
        async fn count_active_sets(
            &self,
            _key_prefix: &str,
            _now_ms: u64,
            _window_ms: u64,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Timeout)
        }
        async fn purge_expired(&self, _now_ms: u64) -> Result<u64, StoreError> {
            Err(StoreError::Timeout)
        }
    }

    #[tokio::test]
    async fn store_failure_collapses_to_admit() {
        let machine = machine_with(
            Arc::new(BrokenStore),
            rate_limit_config(),
            captcha_config(false),
        );
        let eval = machine.evaluate_ip("18.0.0.1", false).await;
        assert_eq!(eval.verdict, Verdict::Admit);

        let decision = machine.enforce_path_budget("18.0.0.1", "/a").await;
        assert!(decision.allowed);
        assert_eq!(decision.limit_type, "ERROR");
    }
}
