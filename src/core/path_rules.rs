//! Path-rule matching for the sliding-window limiter.
//!
//! Rules are immutable snapshots; a reload swaps the whole set so no reader
//! ever observes a half-updated configuration. Patterns use `*` for exactly
//! one path segment and `**` for any number of segments including zero; no
//! regex is exposed to configuration.

use std::sync::{Arc, RwLock};

use log::debug;

use crate::models::{PathRuleConfig, SlidingWindowConfig};

/// Resolved limit parameters for one request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRule {
    pub window_seconds: u64,
    pub max_requests: u32,
}

#[derive(Debug, Clone)]
struct PathRule {
    pattern: String,
    window_seconds: u64,
    max_requests: u32,
    enabled: bool,
}

/// An immutable, ordered rule set plus the default fallback rule.
#[derive(Debug)]
pub struct PathRuleSet {
    rules: Vec<PathRule>,
    default_rule: ResolvedRule,
}

impl PathRuleSet {
    pub fn from_config(config: &SlidingWindowConfig) -> Self {
        let rules = config
            .path_rules
            .iter()
            .map(|rule: &PathRuleConfig| PathRule {
                pattern: rule.pattern.clone(),
                window_seconds: rule.window_seconds,
                max_requests: rule.max_requests,
                enabled: rule.enabled,
            })
            .collect();
        Self {
            rules,
            default_rule: ResolvedRule {
                window_seconds: config.default_window_size,
                max_requests: config.default_max_requests,
            },
        }
    }

    /// First enabled rule whose pattern matches wins; otherwise the default.
    pub fn resolve(&self, path: &str) -> ResolvedRule {
        for rule in &self.rules {
            if rule.enabled && path_matches(&rule.pattern, path) {
                debug!(
                    "path rule matched - pattern: {}, path: {}, window: {}s, max: {}",
                    rule.pattern, path, rule.window_seconds, rule.max_requests
                );
                return ResolvedRule {
                    window_seconds: rule.window_seconds,
                    max_requests: rule.max_requests,
                };
            }
        }
        self.default_rule
    }
}

/// Holder whose readers always see a complete snapshot.
pub struct PathRuleSnapshot {
    inner: RwLock<Arc<PathRuleSet>>,
}

impl PathRuleSnapshot {
    pub fn new(config: &SlidingWindowConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(PathRuleSet::from_config(config))),
        }
    }

    pub fn current(&self) -> Arc<PathRuleSet> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Atomic snapshot replacement.
    pub fn reload(&self, config: &SlidingWindowConfig) {
        let next = Arc::new(PathRuleSet::from_config(config));
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

/// Match a request path against a `*`/`**` pattern, segment by segment.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern_segments, &path_segments)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            // Consume zero segments or one and keep the wildcard alive.
            match_segments(&pattern[1..], path)
                || (!path.is_empty() && match_segments(pattern, &path[1..]))
        }
        Some(&"*") => !path.is_empty() && match_segments(&pattern[1..], &path[1..]),
        Some(&literal) => {
            !path.is_empty() && path[0] == literal && match_segments(&pattern[1..], &path[1..])
        }
    }
}
