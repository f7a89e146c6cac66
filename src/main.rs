//! Gateway Defense Service
//!
//! Entry point: loads configuration, selects the state store back-end,
//! wires the filter chain and background tasks, and starts the web server.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::info;

use gateway_defense_service::api::{self, ApiState};
use gateway_defense_service::config;
use gateway_defense_service::core::abuse::AbuseStateMachine;
use gateway_defense_service::core::audit::{
    AuditSink, AuditStore, MemoryAuditStore, RedisAuditStore,
};
use gateway_defense_service::core::browser::BrowserScorer;
use gateway_defense_service::core::captcha::CaptchaVerifier;
use gateway_defense_service::core::chain::FilterChain;
use gateway_defense_service::core::health::HealthMonitor;
use gateway_defense_service::core::identity::IdentityResolver;
use gateway_defense_service::core::limiter::SlidingWindowLimiter;
use gateway_defense_service::core::memory_store::MemoryStore;
use gateway_defense_service::core::path_rules::PathRuleSnapshot;
use gateway_defense_service::core::redis_store::RedisStore;
use gateway_defense_service::core::store::StateStore;
use gateway_defense_service::core::tasks;
use gateway_defense_service::filters::{
    AccessLoggerFilter, AccessRecorderFilter, ApiRateLimitFilter, BrowserDetectionFilter,
    DdosDefenseFilter, RequestLoggerFilter, TraceInitFilter,
};
use gateway_defense_service::proxy::UpstreamClient;
use gateway_defense_service::utils;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    info!("Starting gateway defense service...");

    let config = config::load_config().expect("Failed to load configuration");
    config::validate_config(&config).expect("Invalid configuration");
    let config = Arc::new(config);

    // Back-end selection: LOCAL_MEMORY for single-node, REMOTE for Redis.
    let (store, audit): (Arc<dyn StateStore>, Arc<dyn AuditStore>) =
        if config.rate_limit.storage_type == "REMOTE" {
            let client = redis::Client::open(config.redis.url.as_str())
                .expect("Failed to create Redis client");
            let audit_key = utils::audit_records_key(&config.rate_limit.redis_key_prefix);
            (
                Arc::new(RedisStore::new(client.clone())),
                Arc::new(RedisAuditStore::new(client, &audit_key)),
            )
        } else {
            (Arc::new(MemoryStore::new()), Arc::new(MemoryAuditStore::new()))
        };
    info!("state store back-end: {}", config.rate_limit.storage_type);

    let rules = Arc::new(PathRuleSnapshot::new(&config.rate_limit.sliding_window));
    let limiter = Arc::new(SlidingWindowLimiter::new(
        Arc::clone(&store),
        Arc::clone(&rules),
        &config.rate_limit.redis_key_prefix,
    ));
    let abuse = Arc::new(AbuseStateMachine::new(
        Arc::clone(&store),
        Arc::clone(&limiter),
        config.rate_limit.clone(),
        config.captcha.clone(),
    ));
    let captcha = Arc::new(CaptchaVerifier::new(
        Arc::clone(&store),
        Arc::clone(&abuse),
        &config.rate_limit.redis_key_prefix,
        &config.rate_limit.captcha_page_path,
    ));
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&store),
        &config.rate_limit.redis_key_prefix,
    ));
    let resolver = Arc::new(IdentityResolver::new(
        config.x_forwarded_for.max_trusted_index,
    ));
    let scorer = Arc::new(BrowserScorer::new(config.browser_detection.clone()));

    let (sink, _audit_writer) =
        AuditSink::start(Arc::clone(&audit), config.access_record.queue_capacity);

    let chain = Arc::new(FilterChain::new(vec![
        Arc::new(TraceInitFilter),
        Arc::new(DdosDefenseFilter::new(
            Arc::clone(&abuse),
            config.rate_limit.clone(),
        )),
        Arc::new(BrowserDetectionFilter::new(
            Arc::clone(&scorer),
            config.browser_detection.clone(),
        )),
        Arc::new(ApiRateLimitFilter::new(
            Arc::clone(&abuse),
            config.rate_limit.clone(),
        )),
        Arc::new(RequestLoggerFilter),
        Arc::new(AccessLoggerFilter),
        Arc::new(AccessRecorderFilter::new(
            sink.clone(),
            config.access_record.enabled,
        )),
    ]));
    info!("filter chain: {:?}", chain.filter_names());

    let upstream = Arc::new(UpstreamClient::new(&config.upstream).expect("upstream client"));

    // Background sweepers.
    let _probe = tasks::spawn_health_probe(Arc::clone(&health));
    let _release = tasks::spawn_captcha_release(Arc::clone(&abuse));
    let _cleanup = tasks::spawn_window_cleanup(Arc::clone(&store));
    if config.access_record.enabled {
        let _retention =
            tasks::spawn_audit_retention(Arc::clone(&audit), config.access_record.retention_days);
    }

    let state = web::Data::new(ApiState {
        abuse,
        captcha,
        health,
        audit,
        resolver,
        chain,
        upstream,
        config: config.clone(),
    });

    let bind = (config.server.host.as_str(), config.server.port);
    info!("listening on {}:{}", config.server.host, config.server.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::config)
            .default_service(web::route().to(api::ingress))
    })
    .bind(bind)?
    .run()
    .await
}
