//! Filter chain and per-request attribute bus.
//!
//! Filters are totally ordered by integer priorities assigned once at
//! startup from a single table. A filter either forwards to the next or
//! terminates the pipeline with a response; completion callbacks always run
//! so the audit trail is written even for short-circuited requests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

/// The seven pipeline slots in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterSlot {
    TraceInit,
    DdosDefense,
    BrowserDetection,
    ApiRateLimit,
    RequestLogger,
    AccessLogger,
    AccessRecorder,
}

/// Single authoritative priority table. Lower runs earlier; the recorder is
/// last so it observes everything the other filters left on the bus.
pub fn filter_order(slot: FilterSlot) -> i32 {
    match slot {
        FilterSlot::TraceInit => 0,
        FilterSlot::DdosDefense => 1,
        FilterSlot::BrowserDetection => 2,
        FilterSlot::ApiRateLimit => 3,
        FilterSlot::RequestLogger => 50,
        FilterSlot::AccessLogger => 100,
        FilterSlot::AccessRecorder => i32::MAX - 1000,
    }
}

/// Terminal response produced by a short-circuiting filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Option<String>,
}

impl TerminalResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            content_type: None,
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: String) -> Self {
        self.content_type = Some("application/json".to_string());
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Forward,
    Terminate(TerminalResponse),
}

/// Monotonic per-request facts. Keys are written at most once; only the
/// response status may be finalized late, by the recorder side of the chain.
#[derive(Debug, Default)]
pub struct Attributes {
    rate_limited: Option<bool>,
    rate_limit_type: Option<String>,
    in_whitelist: Option<bool>,
    in_blacklist: Option<bool>,
    blacklist_info: Option<String>,
    record_id: Option<String>,
    response_status: Option<u16>,
    response_body_excerpt: Option<String>,
    advisory: Option<String>,
}

impl Attributes {
    fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) {
        if slot.is_some() {
            warn!("attribute {} already set, keeping the earlier value", key);
            return;
        }
        *slot = Some(value);
    }

    pub fn set_rate_limited(&mut self, value: bool) {
        Self::set_once(&mut self.rate_limited, value, "rate_limited");
    }

    pub fn rate_limited(&self) -> Option<bool> {
        self.rate_limited
    }

    pub fn set_rate_limit_type(&mut self, value: &str) {
        Self::set_once(&mut self.rate_limit_type, value.to_string(), "rate_limit_type");
    }

    pub fn rate_limit_type(&self) -> Option<&str> {
        self.rate_limit_type.as_deref()
    }

    pub fn set_in_whitelist(&mut self, value: bool) {
        Self::set_once(&mut self.in_whitelist, value, "in_whitelist");
    }

    pub fn in_whitelist(&self) -> Option<bool> {
        self.in_whitelist
    }

    pub fn set_in_blacklist(&mut self, value: bool) {
        Self::set_once(&mut self.in_blacklist, value, "in_blacklist");
    }

    pub fn in_blacklist(&self) -> Option<bool> {
        self.in_blacklist
    }

    pub fn set_blacklist_info(&mut self, value: &str) {
        Self::set_once(&mut self.blacklist_info, value.to_string(), "blacklist_info");
    }

    pub fn blacklist_info(&self) -> Option<&str> {
        self.blacklist_info.as_deref()
    }

    pub fn set_record_id(&mut self, value: &str) {
        Self::set_once(&mut self.record_id, value.to_string(), "record_id");
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    /// The one late-write exception: the recorder finalizes the status.
    pub fn finalize_response_status(&mut self, status: u16) {
        self.response_status = Some(status);
    }

    pub fn response_status(&self) -> Option<u16> {
        self.response_status
    }

    pub fn set_response_body_excerpt(&mut self, value: &str) {
        Self::set_once(
            &mut self.response_body_excerpt,
            value.to_string(),
            "response_body_excerpt",
        );
    }

    pub fn response_body_excerpt(&self) -> Option<&str> {
        self.response_body_excerpt.as_deref()
    }

    pub fn set_advisory(&mut self, value: &str) {
        Self::set_once(&mut self.advisory, value.to_string(), "advisory");
    }

    pub fn advisory(&self) -> Option<&str> {
        self.advisory.as_deref()
    }
}

/// Immutable request facts plus the mutable attribute bus. Lives for one
/// request and is dropped once the audit record is enqueued.
#[derive(Debug)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    /// Header map with lowercased names.
    pub headers: HashMap<String, String>,
    pub remote_addr: Option<String>,
    /// Canonical client IP, resolved exactly once before the chain runs.
    pub client_ip: String,
    pub trace_id: String,
    pub arrival_ms: u64,
    pub attributes: Attributes,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

#[async_trait]
pub trait GatewayFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn slot(&self) -> FilterSlot;

    async fn on_request(&self, ctx: &mut RequestContext) -> FilterOutcome;

    /// Called after the response status is known, for admitted and
    /// terminated requests alike.
    async fn on_complete(&self, _ctx: &mut RequestContext, _status: u16) {}
}

pub struct FilterChain {
    filters: Vec<Arc<dyn GatewayFilter>>,
}

impl FilterChain {
    /// Order the filters by the authoritative table once at startup.
    pub fn new(mut filters: Vec<Arc<dyn GatewayFilter>>) -> Self {
        filters.sort_by_key(|filter| filter_order(filter.slot()));
        Self { filters }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Run the request phase. Returns the terminal response of the first
    /// filter that short-circuits, or None when every filter forwarded.
    pub async fn run(&self, ctx: &mut RequestContext) -> Option<TerminalResponse> {
        for filter in &self.filters {
            match filter.on_request(ctx).await {
                FilterOutcome::Forward => {}
                FilterOutcome::Terminate(response) => {
                    info!(
                        "filter {} terminated request - IP: {}, path: {}, status: {}",
                        filter.name(),
                        ctx.client_ip,
                        ctx.path,
                        response.status
                    );
                    return Some(response);
                }
            }
        }
        None
    }

    /// Run the completion phase in chain order.
    pub async fn complete(&self, ctx: &mut RequestContext, status: u16) {
        for filter in &self.filters {
            filter.on_complete(ctx, status).await;
        }
    }
}
