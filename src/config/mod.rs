//! Configuration management for the gateway defense service.
//!
//! This module handles loading and validating application configuration
//! from environment variables and configuration files.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use thiserror::Error;

use crate::models::Config;

#[derive(Error, Debug)]
pub enum ConfigValidationError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load configuration from the config file and environment variables.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("redis.pool_size", 10)?
        .set_default("upstream.base_url", "http://127.0.0.1:8081")?
        .set_default("upstream.connect_timeout_ms", 2000)?
        .set_default("upstream.response_timeout_ms", 10_000)?
        // Rate limit defaults
        .set_default("rate_limit.enabled", true)?
        .set_default("rate_limit.storage_type", "LOCAL_MEMORY")?
        .set_default("rate_limit.redis_key_prefix", "rate_limit")?
        .set_default("rate_limit.sliding_window.default_window_size", 1)?
        .set_default("rate_limit.sliding_window.default_max_requests", 10)?
        .set_default("rate_limit.ddos_threshold_ip_count", 50)?
        .set_default("rate_limit.ddos_release_ip_count", 10)?
        .set_default("rate_limit.ip_track_duration_seconds", 10)?
        .set_default("rate_limit.white_list_duration_minutes", 5)?
        .set_default("rate_limit.black_list_duration_minutes", 30)?
        .set_default("rate_limit.captcha_duration_minutes", 5)?
        .set_default("rate_limit.black_list_enabled", true)?
        .set_default(
            "rate_limit.skip_paths",
            vec!["/static/captcha.html", "/captcha", "/validate-captcha", "/api/rate-limit/**"],
        )?
        .set_default("rate_limit.captcha_page_path", "/static/captcha.html")?
        .set_default("rate_limit.base_url", "")?
        .set_default("rate_limit.verbose_logging", false)?
        // CAPTCHA behavior defaults
        .set_default("captcha.strict_mode", false)?
        .set_default("captcha.allow_api_when_captcha_active", true)?
        .set_default("captcha.api_path_prefixes", vec!["/api/"])?
        // Browser detection defaults
        .set_default("browser_detection.enabled", true)?
        .set_default("browser_detection.strictness", "MODERATE")?
        .set_default("browser_detection.min_user_agent_length", 20)?
        .set_default("browser_detection.max_user_agent_length", 1000)?
        .set_default("browser_detection.check_javascript_support", true)?
        .set_default(
            "browser_detection.rejection_message",
            "Access denied: Non-browser request detected",
        )?
        .set_default("browser_detection.skip_paths", vec!["/actuator/**", "/health/**"])?
        // Security header defaults
        .set_default("security.enable_security_headers", true)?
        .set_default("security.referrer_policy", "no-referrer")?
        .set_default("security.frame_options", "SAMEORIGIN")?
        .set_default(
            "security.content_security_policy",
            "default-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline'; frame-src 'self';",
        )?
        .set_default("x_forwarded_for.max_trusted_index", 1)?
        // Audit record defaults
        .set_default("access_record.enabled", true)?
        .set_default("access_record.retention_days", 30)?
        .set_default("access_record.queue_capacity", 1024)?
        .build()?;

    config.try_deserialize()
}

/// Validate a loaded configuration. Failures are fatal at startup.
pub fn validate_config(config: &Config) -> Result<(), ConfigValidationError> {
    let rl = &config.rate_limit;

    match rl.storage_type.as_str() {
        "LOCAL_MEMORY" | "REMOTE" => {}
        other => {
            return Err(ConfigValidationError::Invalid(format!(
                "rate_limit.storage_type must be LOCAL_MEMORY or REMOTE, got {}",
                other
            )))
        }
    }

    if rl.ddos_release_ip_count >= rl.ddos_threshold_ip_count {
        return Err(ConfigValidationError::Invalid(format!(
            "ddos_release_ip_count ({}) must be below ddos_threshold_ip_count ({})",
            rl.ddos_release_ip_count, rl.ddos_threshold_ip_count
        )));
    }

    if rl.sliding_window.default_window_size == 0 || rl.sliding_window.default_max_requests == 0 {
        return Err(ConfigValidationError::Invalid(
            "default sliding window must have a non-zero size and budget".to_string(),
        ));
    }

    for rule in &rl.sliding_window.path_rules {
        if rule.window_seconds == 0 || rule.max_requests == 0 {
            return Err(ConfigValidationError::Invalid(format!(
                "path rule {} must have a non-zero window and budget",
                rule.pattern
            )));
        }
        if rule.pattern.is_empty() {
            return Err(ConfigValidationError::Invalid("path rule with empty pattern".to_string()));
        }
    }

    if rl.ip_track_duration_seconds == 0 {
        return Err(ConfigValidationError::Invalid(
            "ip_track_duration_seconds must be positive".to_string(),
        ));
    }

    let bd = &config.browser_detection;
    if bd.min_user_agent_length >= bd.max_user_agent_length {
        return Err(ConfigValidationError::Invalid(
            "browser_detection user agent length bounds are inverted".to_string(),
        ));
    }

    if config.access_record.retention_days <= 0 {
        return Err(ConfigValidationError::Invalid(
            "access_record.retention_days must be positive".to_string(),
        ));
    }

    Ok(())
}
