//! Core of the admission and abuse-defense pipeline.
//!
//! This module holds the algorithms: the state store contract with its two
//! back-ends, the sliding-window limiter, identity resolution, browser
//! scoring, the abuse state machine, CAPTCHA verification, the filter chain
//! and the audit sink.

pub mod abuse;
pub mod audit;
pub mod browser;
pub mod captcha;
pub mod chain;
pub mod health;
pub mod identity;
pub mod limiter;
pub mod memory_store;
pub mod path_rules;
pub mod redis_store;
pub mod store;
pub mod tasks;

pub use abuse::{AbuseStateMachine, IpEvaluation, Verdict};
pub use audit::{AdmissionRecord, AuditSink, AuditStore, MemoryAuditStore, RedisAuditStore};
pub use browser::{BrowserScorer, DetectionResult};
pub use captcha::{CaptchaOutcome, CaptchaVerifier};
pub use chain::{FilterChain, FilterOutcome, FilterSlot, GatewayFilter, RequestContext, TerminalResponse};
pub use health::HealthMonitor;
pub use identity::IdentityResolver;
pub use limiter::{RateLimitDecision, SlidingWindowLimiter};
pub use memory_store::MemoryStore;
pub use path_rules::{PathRuleSet, PathRuleSnapshot};
pub use redis_store::RedisStore;
pub use store::{StateStore, StoreError, WindowAdmission};
