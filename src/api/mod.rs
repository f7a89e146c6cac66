//! HTTP surface: the ingress handler that runs the admission pipeline, the
//! CAPTCHA endpoints, and the admin API over the core's state.

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::core::abuse::AbuseStateMachine;
use crate::core::audit::AuditStore;
use crate::core::captcha::{CaptchaOutcome, CaptchaVerifier};
use crate::core::chain::{Attributes, FilterChain, RequestContext, TerminalResponse};
use crate::core::health::HealthMonitor;
use crate::core::identity::{location_type, IdentityResolver};
use crate::filters::ADVISORY_HEADER;
use crate::models::Config;
use crate::proxy::UpstreamClient;
use crate::utils;

pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// Shared state handed to every handler.
pub struct ApiState {
    pub abuse: Arc<AbuseStateMachine>,
    pub captcha: Arc<CaptchaVerifier>,
    pub health: Arc<HealthMonitor>,
    pub audit: Arc<dyn AuditStore>,
    pub resolver: Arc<IdentityResolver>,
    pub chain: Arc<FilterChain>,
    pub upstream: Arc<UpstreamClient>,
    pub config: Arc<Config>,
}

/// Route registration for the admin and CAPTCHA surface.
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/captcha-info").route(web::get().to(captcha_info)))
        .service(web::resource("/captcha").route(web::get().to(issue_captcha)))
        .service(web::resource("/validate-captcha").route(web::post().to(validate_captcha)))
        .service(
            web::scope("/api/rate-limit")
                .service(web::resource("/status").route(web::get().to(status)))
                .service(web::resource("/verify-captcha").route(web::post().to(verify_captcha)))
                .service(
                    web::resource("/admin/whitelist/{ip}")
                        .route(web::post().to(add_whitelist))
                        .route(web::delete().to(remove_whitelist)),
                )
                .service(
                    web::resource("/admin/blacklist/{ip}")
                        .route(web::post().to(add_blacklist))
                        .route(web::delete().to(remove_blacklist)),
                )
                .service(
                    web::resource("/admin/blacklist/check/{ip}").route(web::get().to(check_blacklist)),
                )
                .service(web::resource("/admin/reset-captcha").route(web::post().to(reset_captcha)))
                .service(web::resource("/admin/stats").route(web::get().to(stats)))
                .service(web::resource("/health/redis").route(web::get().to(store_health))),
        )
        .service(
            web::scope("/admin/rate-limit-logs")
                .service(web::resource("/by-ip").route(web::get().to(logs_by_ip)))
                .service(web::resource("/count").route(web::get().to(logs_count)))
                .service(web::resource("/ddos").route(web::get().to(logs_ddos))),
        );
}

/// Lowercased header map snapshot for the request context.
pub fn header_map(req: &HttpRequest) -> HashMap<String, String> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

fn client_ip(state: &ApiState, req: &HttpRequest) -> String {
    let headers = header_map(req);
    let remote = req.peer_addr().map(|addr| addr.to_string());
    state.resolver.resolve(&headers, remote.as_deref())
}

// ---- ingress ----

/// Status recorded when the client goes away mid-request.
const STATUS_CLIENT_CLOSED: u16 = 499;

/// Default service: every non-admin request runs the admission pipeline and,
/// when admitted, is forwarded upstream.
pub async fn ingress(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<ApiState>,
) -> HttpResponse {
    let headers = header_map(&req);
    let remote = req.peer_addr().map(|addr| addr.to_string());
    let client_ip = state.resolver.resolve(&headers, remote.as_deref());
    let trace_id = headers
        .get("x-trace-id")
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut ctx = RequestContext {
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        headers,
        remote_addr: remote,
        client_ip,
        trace_id,
        arrival_ms: utils::current_millis(),
        attributes: Attributes::default(),
    };

    let response = match state.chain.run(&mut ctx).await {
        Some(terminal) => terminal_to_response(&ctx, &state, terminal),
        None => match read_body(payload).await {
            Ok(body) => {
                let forwarded = state.upstream.forward(&ctx, body).await;
                let mut builder = HttpResponse::build(
                    StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY),
                );
                for (name, value) in &forwarded.headers {
                    builder.insert_header((name.as_str(), value.as_str()));
                }
                decorate(&mut builder, &ctx, &state);
                builder.body(forwarded.body)
            }
            Err(err) => {
                // Client closed or broke the stream before the body arrived.
                warn!(
                    "request body read failed - IP: {}, path: {}, error: {}",
                    ctx.client_ip, ctx.path, err
                );
                let mut builder = HttpResponse::build(
                    StatusCode::from_u16(STATUS_CLIENT_CLOSED)
                        .unwrap_or(StatusCode::BAD_REQUEST),
                );
                decorate(&mut builder, &ctx, &state);
                builder.finish()
            }
        },
    };

    let status = response.status().as_u16();
    state.chain.complete(&mut ctx, status).await;
    response
}

async fn read_body(mut payload: web::Payload) -> Result<Vec<u8>, actix_web::error::PayloadError> {
    let mut body = Vec::new();
    while let Some(chunk) = payload.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

fn terminal_to_response(
    ctx: &RequestContext,
    state: &ApiState,
    terminal: TerminalResponse,
) -> HttpResponse {
    let mut builder =
        HttpResponse::build(StatusCode::from_u16(terminal.status).unwrap_or(StatusCode::FORBIDDEN));
    for (name, value) in &terminal.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    if let Some(content_type) = &terminal.content_type {
        builder.content_type(content_type.as_str());
    }
    decorate(&mut builder, ctx, state);
    match terminal.body {
        Some(body) => builder.body(body),
        None => builder.finish(),
    }
}

/// Trace id, advisory and the security headers on every response.
fn decorate(
    builder: &mut actix_web::HttpResponseBuilder,
    ctx: &RequestContext,
    state: &ApiState,
) {
    builder.insert_header((TRACE_ID_HEADER, ctx.trace_id.as_str()));
    if let Some(advisory) = ctx.attributes.advisory() {
        builder.insert_header((ADVISORY_HEADER, advisory));
    }

    let security = &state.config.security;
    if security.enable_security_headers {
        builder.insert_header(("X-XSS-Protection", "1; mode=block"));
        builder.insert_header(("X-Frame-Options", security.frame_options.as_str()));
        builder.insert_header(("X-Content-Type-Options", "nosniff"));
        builder.insert_header(("Referrer-Policy", security.referrer_policy.as_str()));
        builder.insert_header((
            "Content-Security-Policy",
            security.content_security_policy.as_str(),
        ));
    }
}

// ---- CAPTCHA ----

async fn captcha_info(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "activeIpCount": state.abuse.active_ip_count().await,
        "captchaRequired": state.abuse.is_captcha_required().await,
    }))
}

/// Mint a challenge for the caller. Rendering the text into an image is
/// delegated to the edge; the body carries the expected text.
async fn issue_captcha(req: HttpRequest, state: web::Data<ApiState>) -> impl Responder {
    let ip = client_ip(&state, &req);
    match state.captcha.issue(&ip).await {
        Some(text) => HttpResponse::Ok().content_type("text/plain").body(text),
        None => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "message": "captcha issue failed",
        })),
    }
}

#[derive(Debug, Deserialize)]
struct CaptchaForm {
    captcha: String,
}

async fn validate_captcha(
    req: HttpRequest,
    form: web::Form<CaptchaForm>,
    state: web::Data<ApiState>,
) -> impl Responder {
    let ip = client_ip(&state, &req);
    info!("captcha submission - IP: {}", ip);
    match state.captcha.verify(&ip, form.captcha.trim()).await {
        CaptchaOutcome::Verified { redirect } | CaptchaOutcome::Rejected { redirect } => {
            HttpResponse::Found()
                .insert_header(("Location", redirect))
                .finish()
        }
    }
}

/// API-shaped verification for clients that cannot follow redirects.
async fn verify_captcha(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    state: web::Data<ApiState>,
) -> impl Responder {
    let ip = client_ip(&state, &req);
    let submitted = query.get("captcha").map(String::as_str).unwrap_or("");

    match state.captcha.verify(&ip, submitted).await {
        CaptchaOutcome::Verified { redirect } => HttpResponse::Ok().json(json!({
            "success": true,
            "message": "verified, caller whitelisted",
            "redirectUrl": redirect,
        })),
        CaptchaOutcome::Rejected { .. } => HttpResponse::Ok().json(json!({
            "success": false,
            "message": "captcha mismatch",
        })),
    }
}

// ---- status and admin ----

async fn status(req: HttpRequest, state: web::Data<ApiState>) -> impl Responder {
    let ip = client_ip(&state, &req);
    HttpResponse::Ok().json(json!({
        "clientIp": ip,
        "ipLocation": location_type(&ip),
        "isWhiteListed": state.abuse.is_in_white_list(&ip).await,
        "isBlackListed": state.abuse.is_in_black_list(&ip).await,
        "captchaRequired": state.abuse.is_captcha_required().await,
        "activeIpCount": state.abuse.active_ip_count().await,
    }))
}

async fn add_whitelist(path: web::Path<String>, state: web::Data<ApiState>) -> impl Responder {
    let ip = path.into_inner();
    if state.abuse.add_to_white_list(&ip).await {
        HttpResponse::Ok().json(json!({"success": true, "message": "IP whitelisted"}))
    } else {
        HttpResponse::InternalServerError()
            .json(json!({"success": false, "message": "whitelist insert failed"}))
    }
}

async fn remove_whitelist(path: web::Path<String>, state: web::Data<ApiState>) -> impl Responder {
    let ip = path.into_inner();
    if state.abuse.remove_from_white_list(&ip).await {
        HttpResponse::Ok().json(json!({"success": true, "message": "IP removed from whitelist"}))
    } else {
        HttpResponse::Ok().json(json!({"success": false, "message": "IP was not whitelisted"}))
    }
}

#[derive(Debug, Deserialize)]
struct BlacklistParams {
    reason: Option<String>,
    #[serde(rename = "durationMinutes")]
    duration_minutes: Option<u64>,
}

async fn add_blacklist(
    path: web::Path<String>,
    query: web::Query<BlacklistParams>,
    state: web::Data<ApiState>,
) -> impl Responder {
    let ip = path.into_inner();
    let reason = query.reason.clone().unwrap_or_else(|| "manual".to_string());
    let duration = query
        .duration_minutes
        .unwrap_or(state.config.rate_limit.black_list_duration_minutes);

    if state.abuse.add_to_black_list(&ip, &reason, duration).await {
        HttpResponse::Ok().json(json!({
            "success": true,
            "message": "IP blacklisted",
            "durationMinutes": duration,
        }))
    } else {
        HttpResponse::InternalServerError()
            .json(json!({"success": false, "message": "blacklist insert failed"}))
    }
}

async fn remove_blacklist(path: web::Path<String>, state: web::Data<ApiState>) -> impl Responder {
    let ip = path.into_inner();
    if state.abuse.remove_from_black_list(&ip).await {
        HttpResponse::Ok().json(json!({"success": true, "message": "IP removed from blacklist"}))
    } else {
        HttpResponse::Ok().json(json!({"success": false, "message": "IP was not blacklisted"}))
    }
}

async fn check_blacklist(path: web::Path<String>, state: web::Data<ApiState>) -> impl Responder {
    let ip = path.into_inner();
    let listed = state.abuse.is_in_black_list(&ip).await;
    let info = state.abuse.black_list_info(&ip).await;
    HttpResponse::Ok().json(json!({
        "ip": ip,
        "blacklisted": listed,
        "info": info,
    }))
}

async fn reset_captcha(state: web::Data<ApiState>) -> impl Responder {
    let released = state.abuse.disable_captcha_required().await;
    HttpResponse::Ok().json(json!({
        "success": true,
        "released": released,
    }))
}

async fn stats(state: web::Data<ApiState>) -> impl Responder {
    let record_count = state.audit.count().await.unwrap_or(0);
    HttpResponse::Ok().json(json!({
        "activeIpCount": state.abuse.active_ip_count().await,
        "captchaRequired": state.abuse.is_captcha_required().await,
        "storeHealthy": state.health.is_healthy(),
        "auditRecordCount": record_count,
    }))
}

async fn store_health(state: web::Data<ApiState>) -> impl Responder {
    let snapshot = state.health.snapshot();
    if snapshot.healthy {
        HttpResponse::Ok().json(snapshot)
    } else {
        HttpResponse::ServiceUnavailable().json(snapshot)
    }
}

// ---- audit log queries ----

#[derive(Debug, Deserialize)]
struct LogQuery {
    ip: Option<String>,
    limit: Option<usize>,
}

async fn logs_by_ip(query: web::Query<LogQuery>, state: web::Data<ApiState>) -> impl Responder {
    let ip = match &query.ip {
        Some(ip) if !ip.is_empty() => ip.clone(),
        _ => {
            return HttpResponse::BadRequest()
                .json(json!({"success": false, "message": "query parameter ip is required"}))
        }
    };
    match state.audit.find_by_ip(&ip, query.limit.unwrap_or(100)).await {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(err) => HttpResponse::InternalServerError()
            .json(json!({"success": false, "message": err.to_string()})),
    }
}

async fn logs_count(state: web::Data<ApiState>) -> impl Responder {
    match state.audit.count().await {
        Ok(count) => HttpResponse::Ok().json(json!({"count": count})),
        Err(err) => HttpResponse::InternalServerError()
            .json(json!({"success": false, "message": err.to_string()})),
    }
}

async fn logs_ddos(query: web::Query<LogQuery>, state: web::Data<ApiState>) -> impl Responder {
    match state.audit.find_ddos(query.limit.unwrap_or(100)).await {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(err) => HttpResponse::InternalServerError()
            .json(json!({"success": false, "message": err.to_string()})),
    }
}
