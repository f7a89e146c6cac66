//! Browser authenticity scoring.
//!
//! Computes an additive integer score across the User-Agent, header and
//! JavaScript-support axes and admits or rejects against a threshold chosen
//! by the configured strictness level. The scorer is stateless and
//! deterministic for identical input headers.

use std::collections::HashMap;

use crate::models::{BrowserDetectionConfig, StrictnessLevel};

const MOBILE_MARKERS: [&str; 7] =
    ["android", "iphone", "ipad", "ipod", "blackberry", "windows phone", "mobile"];

/// One axis of the detection score with its contributing reasons.
#[derive(Debug, Clone, Default)]
pub struct AxisScore {
    pub score: i32,
    pub reasons: Vec<String>,
}

impl AxisScore {
    fn penalty(&mut self, points: i32, reason: &str) {
        self.score -= points;
        self.reasons.push(format!("-{}: {}", points, reason));
    }

    fn bonus(&mut self, points: i32, reason: &str) {
        self.score += points;
        self.reasons.push(format!("+{}: {}", points, reason));
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub user_agent: AxisScore,
    pub headers: AxisScore,
    pub javascript: AxisScore,
    pub final_score: i32,
    pub is_browser: bool,
    pub rejection_reason: Option<String>,
}

pub struct BrowserScorer {
    config: BrowserDetectionConfig,
}

impl BrowserScorer {
    pub fn new(config: BrowserDetectionConfig) -> Self {
        Self { config }
    }

    pub fn admission_threshold(&self) -> i32 {
        match self.config.strictness {
            StrictnessLevel::Strict => 50,
            StrictnessLevel::Moderate => 20,
            StrictnessLevel::Loose => -20,
        }
    }

    /// On internal failure STRICT rejects, the other levels admit.
    pub fn admit_on_error(&self) -> bool {
        self.config.strictness != StrictnessLevel::Strict
    }

    /// Score one request. Header keys are expected lowercased.
    pub fn detect(&self, headers: &HashMap<String, String>) -> DetectionResult {
        let user_agent = self.score_user_agent(headers.get("user-agent").map(String::as_str));
        let header_axis = self.score_headers(headers);
        let javascript = self.score_javascript(headers);

        let final_score = user_agent.score + header_axis.score + javascript.score;
        let threshold = self.admission_threshold();
        let is_browser = final_score >= threshold;

        let rejection_reason = if is_browser {
            None
        } else {
            Some(format!(
                "browser detection failed - score: {} (threshold: {}). UA({}), Headers({}), JS({})",
                final_score,
                threshold,
                user_agent.reasons.join("; "),
                header_axis.reasons.join("; "),
                javascript.reasons.join("; ")
            ))
        };

        DetectionResult {
            user_agent,
            headers: header_axis,
            javascript,
            final_score,
            is_browser,
            rejection_reason,
        }
    }

    fn score_user_agent(&self, user_agent: Option<&str>) -> AxisScore {
        let mut axis = AxisScore::default();

        let ua = match user_agent {
            Some(ua) if !ua.trim().is_empty() => ua,
            _ => {
                axis.penalty(50, "missing User-Agent");
                return axis;
            }
        };

        if ua.len() < self.config.min_user_agent_length {
            axis.penalty(30, "User-Agent too short");
        }
        if ua.len() > self.config.max_user_agent_length {
            axis.penalty(20, "User-Agent too long");
        }

        let lowered = ua.to_lowercase();
        for keyword in &self.config.bot_user_agents {
            if lowered.contains(&keyword.to_lowercase()) {
                axis.penalty(80, &format!("bot keyword: {}", keyword));
                break; // one match is enough
            }
        }

        let mut has_browser_signature = false;
        for keyword in &self.config.real_browser_user_agents {
            if ua.contains(keyword.as_str()) {
                axis.bonus(20, &format!("browser keyword: {}", keyword));
                has_browser_signature = true;
                break;
            }
        }
        if !has_browser_signature {
            axis.penalty(40, "no browser keyword");
        }

        if MOBILE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            axis.bonus(10, "mobile browser");
        }

        if ua.contains('(') && ua.contains(')') && ua.contains(';') {
            axis.bonus(15, "complex User-Agent structure");
        } else {
            axis.penalty(25, "simple User-Agent structure");
        }

        axis
    }

    fn score_headers(&self, headers: &HashMap<String, String>) -> AxisScore {
        let mut axis = AxisScore::default();

        let mut missing = 0;
        for required in &self.config.required_browser_headers {
            if headers.contains_key(&required.to_lowercase()) {
                axis.bonus(5, &format!("required header present: {}", required));
            } else {
                missing += 1;
                axis.penalty(15, &format!("missing required header: {}", required));
            }
        }
        if missing > 2 {
            axis.penalty(30, "too many required headers missing");
        }

        if let Some(accept) = headers.get("accept") {
            if accept.contains("text/html") && accept.contains("*/*") {
                axis.bonus(15, "browser-like Accept header");
            } else if accept == "*/*" {
                axis.penalty(20, "trivial Accept header");
            }
        }

        if let Some(language) = headers.get("accept-language") {
            if language.contains(',') && language.contains("q=") {
                axis.bonus(10, "Accept-Language with quality values");
            }
        }

        if let Some(encoding) = headers.get("accept-encoding") {
            if encoding.contains("gzip") || encoding.contains("deflate") {
                axis.bonus(10, "compression supported");
            }
        }

        for suspicious in &self.config.suspicious_headers {
            if headers.contains_key(&suspicious.to_lowercase()) {
                axis.penalty(10, &format!("suspicious header: {}", suspicious));
            }
        }

        if let Some(connection) = headers.get("connection") {
            if connection.eq_ignore_ascii_case("keep-alive") {
                axis.bonus(5, "keep-alive connection");
            }
        }

        axis
    }

    fn score_javascript(&self, headers: &HashMap<String, String>) -> AxisScore {
        let mut axis = AxisScore::default();
        if !self.config.check_javascript_support {
            return axis;
        }

        if headers
            .get("x-requested-with")
            .map_or(false, |value| value == "XMLHttpRequest")
        {
            axis.bonus(20, "XMLHttpRequest marker");
        }

        if headers.get("referer").map_or(false, |value| !value.is_empty()) {
            axis.bonus(10, "Referer present");
        }

        axis
    }
}
