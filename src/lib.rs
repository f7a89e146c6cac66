//! Gateway defense service library.
//!
//! An HTTP ingress gateway that runs an admission and abuse-defense
//! pipeline in front of an upstream service: identity resolution, browser
//! authenticity scoring, sliding-window rate limiting, DDoS hysteresis with
//! a CAPTCHA challenge, and a durable audit trail.

pub mod api;
pub mod config;
pub mod core;
pub mod filters;
pub mod models;
pub mod proxy;
pub mod utils;
