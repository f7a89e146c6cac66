//! CAPTCHA issue and verification.
//!
//! The expected text is bound to an IP with a short TTL; rendering the text
//! into an image is delegated to the edge. A successful submission promotes
//! the IP from the blacklist into the whitelist as one user-observable
//! transition.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::core::abuse::AbuseStateMachine;
use crate::core::store::StateStore;
use crate::utils;

/// TTL of a minted challenge.
const CAPTCHA_TTL: Duration = Duration::from_secs(60);
/// Length of the expected text.
const CAPTCHA_LEN: usize = 4;

/// Outcome of a verification attempt, carrying the redirect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaOutcome {
    /// Verified; client goes back to the site root.
    Verified { redirect: String },
    /// Wrong or expired text; client returns to the challenge page.
    Rejected { redirect: String },
}

pub struct CaptchaVerifier {
    store: Arc<dyn StateStore>,
    abuse: Arc<AbuseStateMachine>,
    key_prefix: String,
    captcha_page_path: String,
}

impl CaptchaVerifier {
    pub fn new(
        store: Arc<dyn StateStore>,
        abuse: Arc<AbuseStateMachine>,
        key_prefix: &str,
        captcha_page_path: &str,
    ) -> Self {
        Self {
            store,
            abuse,
            key_prefix: key_prefix.to_string(),
            captcha_page_path: captcha_page_path.to_string(),
        }
    }

    /// Mint the expected text for an IP and store it for one minute.
    /// Returns the text so the caller can render it.
    pub async fn issue(&self, ip: &str) -> Option<String> {
        let text: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CAPTCHA_LEN)
            .map(char::from)
            .collect::<String>()
            .to_uppercase();

        let key = utils::ip_captcha_key(&self.key_prefix, ip);
        match self.store.set_with_ttl(&key, &text, CAPTCHA_TTL).await {
            Ok(()) => {
                info!("captcha issued - IP: {}", ip);
                Some(text)
            }
            Err(err) => {
                error!("captcha issue failed - IP: {}, error: {}", ip, err);
                None
            }
        }
    }

    /// Expected text currently bound to an IP, if any.
    pub async fn expected_text(&self, ip: &str) -> Option<String> {
        let key = utils::ip_captcha_key(&self.key_prefix, ip);
        match self.store.get(&key).await {
            Ok(text) => text,
            Err(err) => {
                error!("captcha lookup failed - IP: {}, error: {}", ip, err);
                None
            }
        }
    }

    /// Verify a submission. On success the IP leaves the blacklist, enters
    /// the whitelist and the stored text is consumed, in that order; partial
    /// failures are logged and the whitelist insertion is the step whose
    /// success the client observes.
    pub async fn verify(&self, ip: &str, submitted: &str) -> CaptchaOutcome {
        let expected = self.expected_text(ip).await;

        match expected {
            Some(expected) if !submitted.is_empty() && expected == submitted => {
                info!("captcha verified - IP: {}", ip);

                if !self.abuse.remove_from_black_list(ip).await {
                    info!("IP was not blacklisted at verification time - IP: {}", ip);
                }
                self.abuse.add_to_white_list(ip).await;

                let key = utils::ip_captcha_key(&self.key_prefix, ip);
                if let Err(err) = self.store.delete(&key).await {
                    error!("consuming captcha text failed - IP: {}, error: {}", ip, err);
                }

                CaptchaOutcome::Verified {
                    redirect: "/".to_string(),
                }
            }
            _ => {
                info!("captcha rejected - IP: {}", ip);
                CaptchaOutcome::Rejected {
                    redirect: self.captcha_page_path.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::limiter::SlidingWindowLimiter;
    use crate::core::memory_store::MemoryStore;
    use crate::core::path_rules::PathRuleSnapshot;
    use crate::models::{CaptchaConfig, RateLimitConfig, SlidingWindowConfig};

    fn setup() -> (Arc<MemoryStore>, Arc<AbuseStateMachine>, CaptchaVerifier) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let config = RateLimitConfig {
            enabled: true,
            storage_type: "LOCAL_MEMORY".to_string(),
            redis_key_prefix: "rate_limit".to_string(),
            sliding_window: SlidingWindowConfig {
                default_window_size: 1,
                default_max_requests: 10,
                path_rules: vec![],
            },
            ddos_threshold_ip_count: 50,
            ddos_release_ip_count: 10,
            ip_track_duration_seconds: 10,
            white_list_duration_minutes: 5,
            black_list_duration_minutes: 30,
            captcha_duration_minutes: 5,
            black_list_enabled: true,
            skip_paths: vec![],
            captcha_page_path: "/static/captcha.html".to_string(),
            base_url: String::new(),
            verbose_logging: false,
        };
        let captcha_config = CaptchaConfig {
            strict_mode: false,
            allow_api_when_captcha_active: true,
            api_path_prefixes: vec!["/api/".to_string()],
        };
        let limiter = Arc::new(SlidingWindowLimiter::new(
            store.clone(),
            Arc::new(PathRuleSnapshot::new(&config.sliding_window)),
            "rate_limit",
        ));
        let abuse = Arc::new(AbuseStateMachine::new(
            store.clone(),
            limiter,
            config,
            captcha_config,
        ));
        let verifier = CaptchaVerifier::new(
            store.clone(),
            Arc::clone(&abuse),
            "rate_limit",
            "/static/captcha.html",
        );
        (store, abuse, verifier)
    }

    #[tokio::test]
    async fn issued_text_is_retrievable_and_uppercase() {
        let (_, _, verifier) = setup();
        let text = verifier.issue("5.5.5.5").await.unwrap();
        assert_eq!(text.len(), 4);
        assert_eq!(text, text.to_uppercase());
        assert_eq!(verifier.expected_text("5.5.5.5").await, Some(text));
    }

    #[tokio::test]
    async fn success_promotes_blacklist_to_whitelist() {
        let (_, abuse, verifier) = setup();
        abuse.add_to_black_list("5.5.5.5", "rate limit trip", 30).await;
        let text = verifier.issue("5.5.5.5").await.unwrap();

        let outcome = verifier.verify("5.5.5.5", &text).await;
        assert_eq!(outcome, CaptchaOutcome::Verified { redirect: "/".to_string() });

        assert!(abuse.is_in_white_list("5.5.5.5").await);
        assert!(!abuse.is_in_black_list("5.5.5.5").await);
        // The stored text is consumed.
        assert_eq!(verifier.expected_text("5.5.5.5").await, None);
    }

    #[tokio::test]
    async fn wrong_text_changes_nothing() {
        let (_, abuse, verifier) = setup();
        abuse.add_to_black_list("6.6.6.6", "rate limit trip", 30).await;
        let text = verifier.issue("6.6.6.6").await.unwrap();

        let outcome = verifier.verify("6.6.6.6", "WRONG").await;
        assert_eq!(
            outcome,
            CaptchaOutcome::Rejected { redirect: "/static/captcha.html".to_string() }
        );

        assert!(abuse.is_in_black_list("6.6.6.6").await);
        assert!(!abuse.is_in_white_list("6.6.6.6").await);
        assert_eq!(verifier.expected_text("6.6.6.6").await, Some(text));
    }

    #[tokio::test]
    async fn missing_challenge_rejects_submission() {
        let (_, _, verifier) = setup();
        let outcome = verifier.verify("7.7.7.7", "ABCD").await;
        assert!(matches!(outcome, CaptchaOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn whitelisted_ip_followup_request_is_admitted() {
        let (_, abuse, verifier) = setup();
        abuse.add_to_black_list("8.8.8.8", "trip", 30).await;
        let text = verifier.issue("8.8.8.8").await.unwrap();
        verifier.verify("8.8.8.8", &text).await;

        let eval = abuse.evaluate_ip("8.8.8.8", false).await;
        assert_eq!(eval.verdict, crate::core::abuse::Verdict::Admit);
        assert!(eval.in_whitelist);
    }

    #[tokio::test]
    async fn collision_of_texts_across_ips_is_isolated() {
        let (_, _, verifier) = setup();
        let a = verifier.issue("1.1.1.1").await.unwrap();
        verifier.issue("2.2.2.2").await.unwrap();
        // Submitting A's text from B's address never verifies B.
        let outcome = verifier.verify("2.2.2.2", &a).await;
        // Only a 1-in-36^4 chance both texts collide; treat equality as skip.
        if verifier.expected_text("2.2.2.2").await != Some(a) {
            assert!(matches!(outcome, CaptchaOutcome::Rejected { .. }));
        }
    }
}
