//! The seven ordered pipeline filters.
//!
//! Each filter adapts one core component onto the chain: trace bootstrap,
//! the IP-level abuse state machine, browser detection, the per-path
//! limiter, the two loggers and the audit recorder. Terminal response
//! shapes follow the ingress contract: 403 with a `redirectUrl` header or a
//! 302 for page clients, 429 JSON for API clients.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::abuse::{AbuseStateMachine, Verdict};
use crate::core::audit::{filter_sensitive_headers, AdmissionRecord, AuditSink};
use crate::core::browser::BrowserScorer;
use crate::core::chain::{
    FilterOutcome, FilterSlot, GatewayFilter, RequestContext, TerminalResponse,
};
use crate::core::path_rules::path_matches;
use crate::models::{BrowserDetectionConfig, RateLimitConfig};
use crate::utils;

pub const REDIRECT_URL_HEADER: &str = "redirectUrl";
pub const ADVISORY_HEADER: &str = "X-RateLimit-Advisory";

const RATE_LIMIT_EXCEEDED_BODY: &str =
    r#"{"code":429,"message":"请求频率过高，请稍后再试","data":null}"#;
const CAPTCHA_REQUIRED_BODY: &str = r#"{"code":429,"message":"需要验证码验证","data":null}"#;

/// Build the absolute (when derivable) CAPTCHA page URL for a challenge.
pub fn captcha_redirect_url(ctx: &RequestContext, config: &RateLimitConfig) -> String {
    let page = &config.captcha_page_path;
    if page.starts_with("http://") || page.starts_with("https://") {
        return page.clone();
    }

    let leading = if page.starts_with('/') {
        page.clone()
    } else {
        format!("/{}", page)
    };

    let base = config.base_url.trim_end_matches('/');
    if !base.is_empty() {
        return format!("{}{}", base, leading);
    }

    match ctx.header("host") {
        Some(host) => {
            let scheme = ctx.header("x-forwarded-proto").unwrap_or("http");
            format!("{}://{}{}", scheme, host, leading)
        }
        None => leading,
    }
}

fn challenge_page(ctx: &RequestContext, config: &RateLimitConfig) -> TerminalResponse {
    TerminalResponse::new(403).header(REDIRECT_URL_HEADER, &captcha_redirect_url(ctx, config))
}

fn challenge_page_redirect(ctx: &RequestContext, config: &RateLimitConfig) -> TerminalResponse {
    TerminalResponse::new(302).header("Location", &captcha_redirect_url(ctx, config))
}

fn challenge_api_captcha() -> TerminalResponse {
    TerminalResponse::new(429).json(CAPTCHA_REQUIRED_BODY.to_string())
}

fn challenge_api_rate_limited() -> TerminalResponse {
    TerminalResponse::new(429).json(RATE_LIMIT_EXCEEDED_BODY.to_string())
}

/// Trace bootstrap. The trace id is resolved while the context is built;
/// this slot pins the chain's entry log line to it.
pub struct TraceInitFilter;

#[async_trait]
impl GatewayFilter for TraceInitFilter {
    fn name(&self) -> &'static str {
        "trace_init"
    }

    fn slot(&self) -> FilterSlot {
        FilterSlot::TraceInit
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> FilterOutcome {
        debug!(
            "request start - traceId: {}, IP: {}, method: {}, path: {}",
            ctx.trace_id, ctx.client_ip, ctx.method, ctx.path
        );
        FilterOutcome::Forward
    }
}

/// IP-level defense: whitelist, blacklist, active-IP tracking and the DDoS
/// hysteresis, evaluated by the abuse state machine.
pub struct DdosDefenseFilter {
    abuse: Arc<AbuseStateMachine>,
    config: RateLimitConfig,
}

impl DdosDefenseFilter {
    pub fn new(abuse: Arc<AbuseStateMachine>, config: RateLimitConfig) -> Self {
        Self { abuse, config }
    }
}

#[async_trait]
impl GatewayFilter for DdosDefenseFilter {
    fn name(&self) -> &'static str {
        "ddos_defense"
    }

    fn slot(&self) -> FilterSlot {
        FilterSlot::DdosDefense
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> FilterOutcome {
        if !self.abuse.enabled() {
            return FilterOutcome::Forward;
        }
        if self.abuse.is_skip_path(&ctx.path) {
            debug!("skip path bypasses defense - IP: {}, path: {}", ctx.client_ip, ctx.path);
            return FilterOutcome::Forward;
        }

        let is_api = self.abuse.is_api_request(&ctx.path);
        let evaluation = self.abuse.evaluate_ip(&ctx.client_ip, is_api).await;

        ctx.attributes.set_in_whitelist(evaluation.in_whitelist);
        ctx.attributes.set_in_blacklist(evaluation.in_blacklist);
        if let Some(info) = &evaluation.blacklist_info {
            ctx.attributes.set_blacklist_info(info);
        }

        match evaluation.verdict {
            Verdict::Admit => FilterOutcome::Forward,
            Verdict::AdmitWithAdvisory(advisory) => {
                ctx.attributes.set_advisory(&advisory);
                FilterOutcome::Forward
            }
            Verdict::Challenge { limit_type } => {
                ctx.attributes.set_rate_limited(true);
                ctx.attributes.set_rate_limit_type(&limit_type);
                if is_api {
                    FilterOutcome::Terminate(challenge_api_captcha())
                } else {
                    FilterOutcome::Terminate(challenge_page(ctx, &self.config))
                }
            }
        }
    }
}

/// Browser authenticity gate.
pub struct BrowserDetectionFilter {
    scorer: Arc<BrowserScorer>,
    config: BrowserDetectionConfig,
}

impl BrowserDetectionFilter {
    pub fn new(scorer: Arc<BrowserScorer>, config: BrowserDetectionConfig) -> Self {
        Self { scorer, config }
    }

    fn should_skip(&self, path: &str) -> bool {
        self.config
            .skip_paths
            .iter()
            .any(|pattern| path_matches(pattern, path) || pattern == path)
    }

    fn reject(&self, detail: Option<String>) -> TerminalResponse {
        let body = serde_json::json!({
            "success": false,
            "message": self.config.rejection_message,
            "code": 403,
            "timestamp": utils::current_millis(),
            "detail": detail,
        });
        TerminalResponse::new(403).json(body.to_string())
    }
}

#[async_trait]
impl GatewayFilter for BrowserDetectionFilter {
    fn name(&self) -> &'static str {
        "browser_detection"
    }

    fn slot(&self) -> FilterSlot {
        FilterSlot::BrowserDetection
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> FilterOutcome {
        if !self.config.enabled || self.should_skip(&ctx.path) {
            return FilterOutcome::Forward;
        }

        let scorer = Arc::clone(&self.scorer);
        let headers = &ctx.headers;
        match catch_unwind(AssertUnwindSafe(|| scorer.detect(headers))) {
            Ok(result) if result.is_browser => {
                debug!(
                    "browser detection passed - IP: {}, score: {}",
                    ctx.client_ip, result.final_score
                );
                FilterOutcome::Forward
            }
            Ok(result) => {
                warn!(
                    "browser detection rejected request - IP: {}, path: {}, score: {}",
                    ctx.client_ip, ctx.path, result.final_score
                );
                FilterOutcome::Terminate(self.reject(result.rejection_reason))
            }
            Err(_) => {
                // Scorer failure: strict rejects, other levels admit.
                if self.scorer.admit_on_error() {
                    warn!("browser detection errored, admitting - IP: {}", ctx.client_ip);
                    FilterOutcome::Forward
                } else {
                    warn!("browser detection errored, rejecting - IP: {}", ctx.client_ip);
                    FilterOutcome::Terminate(self.reject(None))
                }
            }
        }
    }
}

/// Per-(ip, path) budget enforcement in the preserved API rate-limit slot.
pub struct ApiRateLimitFilter {
    abuse: Arc<AbuseStateMachine>,
    config: RateLimitConfig,
}

impl ApiRateLimitFilter {
    pub fn new(abuse: Arc<AbuseStateMachine>, config: RateLimitConfig) -> Self {
        Self { abuse, config }
    }
}

#[async_trait]
impl GatewayFilter for ApiRateLimitFilter {
    fn name(&self) -> &'static str {
        "api_rate_limit"
    }

    fn slot(&self) -> FilterSlot {
        FilterSlot::ApiRateLimit
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> FilterOutcome {
        if !self.abuse.enabled() || self.abuse.is_skip_path(&ctx.path) {
            return FilterOutcome::Forward;
        }

        // An exchange stamped by a prior CAPTCHA verification passes.
        if ctx.header("x-captcha-verified") == Some("true") {
            debug!("captcha-verified request passes - IP: {}", ctx.client_ip);
            return FilterOutcome::Forward;
        }

        // Whitelisted callers do not update the counters.
        if ctx.attributes.in_whitelist() == Some(true) {
            return FilterOutcome::Forward;
        }

        let decision = self.abuse.enforce_path_budget(&ctx.client_ip, &ctx.path).await;
        if decision.allowed {
            return FilterOutcome::Forward;
        }

        ctx.attributes.set_rate_limited(true);
        ctx.attributes.set_rate_limit_type(&decision.limit_type);
        info!(
            "path budget exceeded - IP: {}, path: {}, count: {:?}/{:?}, window: {:?}s",
            ctx.client_ip, ctx.path, decision.current_count, decision.threshold,
            decision.window_size
        );

        if self.abuse.is_api_request(&ctx.path) {
            FilterOutcome::Terminate(challenge_api_rate_limited())
        } else {
            FilterOutcome::Terminate(challenge_page_redirect(ctx, &self.config))
        }
    }
}

/// Request-detail logging.
pub struct RequestLoggerFilter;

#[async_trait]
impl GatewayFilter for RequestLoggerFilter {
    fn name(&self) -> &'static str {
        "request_logger"
    }

    fn slot(&self) -> FilterSlot {
        FilterSlot::RequestLogger
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> FilterOutcome {
        debug!(
            "request detail - IP: {}, method: {}, path: {}, UA: {}",
            ctx.client_ip,
            ctx.method,
            ctx.path,
            ctx.user_agent().unwrap_or("-")
        );
        FilterOutcome::Forward
    }
}

/// Structured access-line logging once the response status is known.
pub struct AccessLoggerFilter;

#[async_trait]
impl GatewayFilter for AccessLoggerFilter {
    fn name(&self) -> &'static str {
        "access_logger"
    }

    fn slot(&self) -> FilterSlot {
        FilterSlot::AccessLogger
    }

    async fn on_request(&self, _ctx: &mut RequestContext) -> FilterOutcome {
        FilterOutcome::Forward
    }

    async fn on_complete(&self, ctx: &mut RequestContext, status: u16) {
        let elapsed = utils::current_millis().saturating_sub(ctx.arrival_ms);
        info!(
            "access - traceId: {}, IP: {}, method: {}, path: {}, status: {}, elapsed: {}ms",
            ctx.trace_id, ctx.client_ip, ctx.method, ctx.path, status, elapsed
        );
    }
}

/// Assembles the admission record and hands it to the audit sink.
pub struct AccessRecorderFilter {
    sink: AuditSink,
    enabled: bool,
}

impl AccessRecorderFilter {
    pub fn new(sink: AuditSink, enabled: bool) -> Self {
        Self { sink, enabled }
    }
}

#[async_trait]
impl GatewayFilter for AccessRecorderFilter {
    fn name(&self) -> &'static str {
        "access_recorder"
    }

    fn slot(&self) -> FilterSlot {
        FilterSlot::AccessRecorder
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> FilterOutcome {
        if self.enabled {
            ctx.attributes.set_record_id(&Uuid::new_v4().to_string());
        }
        FilterOutcome::Forward
    }

    async fn on_complete(&self, ctx: &mut RequestContext, status: u16) {
        if !self.enabled {
            return;
        }
        ctx.attributes.finalize_response_status(status);

        let record = AdmissionRecord {
            id: ctx
                .attributes
                .record_id()
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            client_ip: ctx.client_ip.clone(),
            request_path: ctx.path.clone(),
            http_method: ctx.method.clone(),
            user_agent: ctx.user_agent().map(str::to_string),
            request_headers: filter_sensitive_headers(&ctx.headers),
            response_status: ctx.attributes.response_status(),
            processing_time_ms: utils::current_millis().saturating_sub(ctx.arrival_ms),
            rate_limited: ctx.attributes.rate_limited().unwrap_or(false),
            rate_limit_type: ctx.attributes.rate_limit_type().map(str::to_string),
            in_whitelist: ctx.attributes.in_whitelist().unwrap_or(false),
            trace_id: ctx.trace_id.clone(),
            access_time: chrono::Utc::now(),
        };
        self.sink.enqueue(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::{AuditStore, MemoryAuditStore};
    use crate::core::chain::FilterChain;
    use crate::core::limiter::SlidingWindowLimiter;
    use crate::core::memory_store::MemoryStore;
    use crate::core::path_rules::PathRuleSnapshot;
    use crate::core::store::StateStore;
    use crate::models::{CaptchaConfig, SlidingWindowConfig, StrictnessLevel};
    use std::collections::HashMap;

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
            ddos_threshold_ip_count: 50,
            ddos_release_ip_count: 10,
            ip_track_duration_seconds: 10,
            white_list_duration_minutes: 5,
            black_list_duration_minutes: 30,
            captcha_duration_minutes: 5,
            black_list_enabled: true,
            skip_paths: vec!["/static/captcha.html".to_string()],
            captcha_page_path: "/static/captcha.html".to_string(),
            base_url: String::new(),
            verbose_logging: false,
        }
    }

    fn browser_config() -> BrowserDetectionConfig {
        BrowserDetectionConfig {
            enabled: true,
            strictness: StrictnessLevel::Moderate,
            min_user_agent_length: 20,
            max_user_agent_length: 1000,
            check_javascript_support: true,
            rejection_message: "Access denied: Non-browser request detected".to_string(),
            skip_paths: vec![],
            bot_user_agents: vec!["curl".to_string(), "bot".to_string()],
            real_browser_user_agents: vec!["Mozilla".to_string(), "Chrome".to_string()],
            required_browser_headers: vec![
                "Accept".to_string(),
                "Accept-Language".to_string(),
                "Accept-Encoding".to_string(),
                "Connection".to_string(),
            ],
            suspicious_headers: vec![],
        }
    }

    struct Pipeline {
        chain: FilterChain,
        abuse: Arc<AbuseStateMachine>,
        audit: Arc<MemoryAuditStore>,
        writer: tokio::task::JoinHandle<()>,
        sink: AuditSink,
    }

    fn build_pipeline() -> Pipeline {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let config = rate_limit_config();
        let captcha = CaptchaConfig {
            strict_mode: false,
            allow_api_when_captcha_active: true,
            api_path_prefixes: vec!["/api/".to_string()],
        };
        let limiter = Arc::new(SlidingWindowLimiter::new(
            Arc::clone(&store),
            Arc::new(PathRuleSnapshot::new(&config.sliding_window)),
            &config.redis_key_prefix,
        ));
        let abuse = Arc::new(AbuseStateMachine::new(
            Arc::clone(&store),
            limiter,
            config.clone(),
            captcha,
        ));

        let audit = Arc::new(MemoryAuditStore::new());
        let (sink, writer) = AuditSink::start(audit.clone(), 64);

        let chain = FilterChain::new(vec![
            Arc::new(TraceInitFilter),
            Arc::new(DdosDefenseFilter::new(Arc::clone(&abuse), config.clone())),
            Arc::new(BrowserDetectionFilter::new(
                Arc::new(BrowserScorer::new(browser_config())),
                browser_config(),
            )),
            Arc::new(ApiRateLimitFilter::new(Arc::clone(&abuse), config)),
            Arc::new(RequestLoggerFilter),
            Arc::new(AccessLoggerFilter),
            Arc::new(AccessRecorderFilter::new(sink.clone(), true)),
        ]);

        Pipeline {
            chain,
            abuse,
            audit,
            writer,
            sink,
        }
    }

    fn browser_context(ip: &str, path: &str) -> RequestContext {
        let mut headers = HashMap::new();
        headers.insert(
            "user-agent".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
        );
        headers.insert("accept".to_string(), "text/html,*/*".to_string());
        headers.insert("accept-language".to_string(), "en-US,en;q=0.9".to_string());
        headers.insert("accept-encoding".to_string(), "gzip, deflate".to_string());
        headers.insert("connection".to_string(), "keep-alive".to_string());
        headers.insert("host".to_string(), "gateway.example".to_string());
        RequestContext {
            method: "GET".to_string(),
            path: path.to_string(),
            headers,
            remote_addr: Some(format!("{}:50000", ip)),
            client_ip: ip.to_string(),
            trace_id: Uuid::new_v4().to_string(),
            arrival_ms: utils::current_millis(),
            attributes: Default::default(),
        }
    }

    #[tokio::test]
    async fn clean_browser_request_is_forwarded() {
        let pipeline = build_pipeline();
        let mut ctx = browser_context("20.0.0.1", "/site/index.html");
        assert!(pipeline.chain.run(&mut ctx).await.is_none());
    }

    #[tokio::test]
    async fn blacklisted_page_client_gets_redirect_header() {
        let pipeline = build_pipeline();
        pipeline.abuse.add_to_black_list("21.0.0.1", "manual", 30).await;

        let mut ctx = browser_context("21.0.0.1", "/site/index.html");
        let terminal = pipeline.chain.run(&mut ctx).await.expect("challenged");
        assert_eq!(terminal.status, 403);
        let redirect = terminal
            .headers
            .iter()
            .find(|(name, _)| name == REDIRECT_URL_HEADER)
            .map(|(_, value)| value.clone())
            .expect("redirectUrl header");
        assert_eq!(redirect, "http://gateway.example/static/captcha.html");
        assert_eq!(ctx.attributes.rate_limit_type(), Some("BLACKLIST_BLOCKED"));
    }

    #[tokio::test]
    async fn non_browser_request_is_rejected_with_json() {
        let pipeline = build_pipeline();
        let mut ctx = browser_context("22.0.0.1", "/site/index.html");
        ctx.headers
            .insert("user-agent".to_string(), "curl/7.79".to_string());
        for name in ["accept", "accept-language", "accept-encoding", "connection"] {
            ctx.headers.remove(name);
        }

        let terminal = pipeline.chain.run(&mut ctx).await.expect("rejected");
        assert_eq!(terminal.status, 403);
        let body = terminal.body.expect("json body");
        assert!(body.contains("\"success\":false"));
        assert!(body.contains("Non-browser request detected"));
    }

    #[tokio::test]
    async fn api_burst_gets_429_json_and_blacklists() {
        let pipeline = build_pipeline();
        for _ in 0..2 {
            let mut ctx = browser_context("23.0.0.1", "/api/data");
            assert!(pipeline.chain.run(&mut ctx).await.is_none());
        }

        let mut ctx = browser_context("23.0.0.1", "/api/data");
        let terminal = pipeline.chain.run(&mut ctx).await.expect("limited");
        assert_eq!(terminal.status, 429);
        assert!(terminal.body.unwrap().contains("429"));
        assert!(pipeline.abuse.is_in_black_list("23.0.0.1").await);
    }

    #[tokio::test]
    async fn page_burst_redirects_to_captcha() {
        let pipeline = build_pipeline();
        for _ in 0..2 {
            let mut ctx = browser_context("24.0.0.1", "/site/page");
            assert!(pipeline.chain.run(&mut ctx).await.is_none());
        }

        let mut ctx = browser_context("24.0.0.1", "/site/page");
        let terminal = pipeline.chain.run(&mut ctx).await.expect("limited");
        assert_eq!(terminal.status, 302);
        assert!(terminal
            .headers
            .iter()
            .any(|(name, value)| name == "Location" && value.contains("captcha")));
    }

    #[tokio::test]
    async fn whitelisted_caller_skips_the_path_budget() {
        let pipeline = build_pipeline();
        pipeline.abuse.add_to_white_list("25.0.0.1").await;

        // Default budget is two; a whitelisted caller sails past it.
        for _ in 0..5 {
            let mut ctx = browser_context("25.0.0.1", "/api/data");
            assert!(pipeline.chain.run(&mut ctx).await.is_none());
            assert_eq!(ctx.attributes.in_whitelist(), Some(true));
        }
    }

    #[tokio::test]
    async fn skip_path_bypasses_everything() {
        let pipeline = build_pipeline();
        pipeline.abuse.add_to_black_list("26.0.0.1", "manual", 30).await;

        let mut ctx = browser_context("26.0.0.1", "/static/captcha.html");
        assert!(pipeline.chain.run(&mut ctx).await.is_none());
    }

    #[tokio::test]
    async fn recorder_persists_the_terminal_decision() {
        let pipeline = build_pipeline();
        pipeline.abuse.add_to_black_list("27.0.0.1", "manual", 30).await;

        let mut ctx = browser_context("27.0.0.1", "/site/index.html");
        ctx.headers
            .insert("authorization".to_string(), "Bearer secret".to_string());
        let terminal = pipeline.chain.run(&mut ctx).await.expect("challenged");
        pipeline.chain.complete(&mut ctx, terminal.status).await;

        drop(pipeline.sink);
        drop(pipeline.chain);
        pipeline.writer.await.unwrap();

        let records = pipeline.audit.find_by_ip("27.0.0.1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.response_status, Some(403));
        assert!(record.rate_limited);
        assert_eq!(record.rate_limit_type.as_deref(), Some("BLACKLIST_BLOCKED"));
        assert!(!record.request_headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn captcha_verified_header_bypasses_the_budget() {
        let pipeline = build_pipeline();
        for _ in 0..5 {
            let mut ctx = browser_context("28.0.0.1", "/api/data");
            ctx.headers
                .insert("x-captcha-verified".to_string(), "true".to_string());
            assert!(pipeline.chain.run(&mut ctx).await.is_none());
        }
    }

    #[test]
    fn redirect_url_prefers_configured_base() {
        let mut config = rate_limit_config();
        config.base_url = "https://edge.example/".to_string();
        let ctx = browser_context("1.1.1.1", "/x");
        assert_eq!(
            captcha_redirect_url(&ctx, &config),
            "https://edge.example/static/captcha.html"
        );

        config.captcha_page_path = "https://captcha.example/page".to_string();
        assert_eq!(captcha_redirect_url(&ctx, &config), "https://captcha.example/page");
    }
}
