use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

/// Per-path limiter rule. First enabled rule whose pattern matches wins.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PathRuleConfig {
    pub pattern: String,
    pub window_seconds: u64,
    pub max_requests: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SlidingWindowConfig {
    /// Fallback window size in seconds when no path rule matches.
    pub default_window_size: u64,
    /// Fallback request budget when no path rule matches.
    pub default_max_requests: u32,
    #[serde(default)]
    pub path_rules: Vec<PathRuleConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// LOCAL_MEMORY or REMOTE.
    pub storage_type: String,
    pub redis_key_prefix: String,
    pub sliding_window: SlidingWindowConfig,
    /// Active-IP count at which CAPTCHA mode engages.
    pub ddos_threshold_ip_count: u64,
    /// Active-IP count at or below which CAPTCHA mode releases.
    pub ddos_release_ip_count: u64,
    pub ip_track_duration_seconds: u64,
    pub white_list_duration_minutes: u64,
    pub black_list_duration_minutes: u64,
    pub captcha_duration_minutes: u64,
    pub black_list_enabled: bool,
    pub skip_paths: Vec<String>,
    pub captcha_page_path: String,
    /// When non-empty, challenge redirects are built against this base URL.
    pub base_url: String,
    pub verbose_logging: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptchaConfig {
    /// Strict mode challenges API clients too; otherwise they pass with an
    /// advisory header while CAPTCHA mode is active.
    pub strict_mode: bool,
    pub allow_api_when_captcha_active: bool,
    pub api_path_prefixes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum StrictnessLevel {
    #[serde(rename = "STRICT")]
    Strict,
    #[serde(rename = "MODERATE")]
    Moderate,
    #[serde(rename = "LOOSE")]
    Loose,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserDetectionConfig {
    pub enabled: bool,
    pub strictness: StrictnessLevel,
    pub min_user_agent_length: usize,
    pub max_user_agent_length: usize,
    pub check_javascript_support: bool,
    pub rejection_message: String,
    pub skip_paths: Vec<String>,
    #[serde(default = "default_bot_user_agents")]
    pub bot_user_agents: Vec<String>,
    #[serde(default = "default_real_browser_user_agents")]
    pub real_browser_user_agents: Vec<String>,
    #[serde(default = "default_required_browser_headers")]
    pub required_browser_headers: Vec<String>,
    #[serde(default = "default_suspicious_headers")]
    pub suspicious_headers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    pub enable_security_headers: bool,
    pub referrer_policy: String,
    pub frame_options: String,
    pub content_security_policy: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct XForwardedForConfig {
    /// Number of hops from the rightmost X-Forwarded-For entry trusted as
    /// proxies; the (1 + index)-th rightmost value is the client.
    pub max_trusted_index: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccessRecordConfig {
    pub enabled: bool,
    pub retention_days: i64,
    pub queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub captcha: CaptchaConfig,
    pub browser_detection: BrowserDetectionConfig,
    pub security: SecurityConfig,
    pub x_forwarded_for: XForwardedForConfig,
    pub access_record: AccessRecordConfig,
}

fn default_true() -> bool {
    true
}

fn default_bot_user_agents() -> Vec<String> {
    [
        "bot", "crawl", "spider", "scrape", "fetch", "curl", "wget", "python", "java",
        "go-http-client", "okhttp", "apache-httpclient", "requests", "urllib", "mechanize",
        "scrapy", "phantom", "headless", "automation", "selenium", "webdriver", "puppeteer",
        "playwright", "test",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_real_browser_user_agents() -> Vec<String> {
    ["Mozilla", "Chrome", "Safari", "Firefox", "Edge", "Opera", "Brave"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_required_browser_headers() -> Vec<String> {
    ["Accept", "Accept-Language", "Accept-Encoding", "Connection"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_suspicious_headers() -> Vec<String> {
    ["X-Requested-With", "X-Forwarded-Proto", "X-Real-IP"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
