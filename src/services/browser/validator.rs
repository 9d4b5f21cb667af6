//! Bot-detection validator: classifies a navigation result against a
//! first-match-wins decision matrix over HTTP status, response headers, and
//! page body text.
//!
//! Grounded on `tests/unit/test_validator_full.py` and
//! `tests/unit/test_validator_extended.py` (the module itself was filtered
//! out of `original_source`, but its test suite pins the exact decision
//! order and pattern sets) plus section 4.4 of the specification.

use std::collections::HashMap;

use crate::core::models::{BlockedBy, ValidationResult};
use crate::services::browser::runtime::NavigationResponse;

pub const CLOUDFLARE_PATTERNS: &[&str] = &[
    "just a moment",
    "checking your browser",
    "cf-browser-verification",
    "cloudflare",
    "ddos protection by cloudflare",
];

pub const CAPTCHA_PATTERNS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "verify you are human",
    "i'm not a robot",
];

pub const RATE_LIMIT_PATTERNS: &[&str] = &[
    "too many requests",
    "rate limit",
    "rate limited",
    "slow down",
];

const LOGIN_WALL_PATTERNS: &[&str] = &[
    "sign in to continue",
    "log in to view",
    "please log in",
    "login required",
    "you need to log in",
];

/// Union of `CLOUDFLARE_PATTERNS`, `CAPTCHA_PATTERNS`, `RATE_LIMIT_PATTERNS`,
/// for callers wanting a single combined "might be blocked" probe.
pub const BLOCK_PATTERNS: &[&[&str]] = &[CLOUDFLARE_PATTERNS, CAPTCHA_PATTERNS, RATE_LIMIT_PATTERNS];

fn status_blocked_by(headers: &HashMap<String, String>) -> Option<BlockedBy> {
    let has = |key: &str| headers.keys().any(|k| k.eq_ignore_ascii_case(key));
    if has("x-amz-cf-id") || has("x-amz-cf-pop") {
        Some(BlockedBy::Cloudfront)
    } else if has("x-akamai-request-id") {
        Some(BlockedBy::Akamai)
    } else {
        None
    }
}

fn matches_any(body_lower: &str, patterns: &[&str]) -> Option<&'static str> {
    patterns.iter().find(|p| body_lower.contains(**p)).copied()
}

/// `true` when short content is expected rather than a sign of a blocked or
/// broken page: a JSON body, a meta-refresh redirect, or a near-empty DOM.
fn is_expected_short_page(body: &str) -> bool {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return true;
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return true;
    }

    let lower = body.to_ascii_lowercase();
    if lower.contains("http-equiv=\"refresh\"") || lower.contains("http-equiv='refresh'") {
        return true;
    }

    let tag_count = body.matches('<').count();
    tag_count <= 20
}

#[derive(Debug, Clone)]
pub struct ResponseValidator {
    min_content_length: usize,
    custom_block_patterns: Vec<String>,
    custom_success_patterns: Vec<String>,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self {
            min_content_length: 500,
            custom_block_patterns: Vec::new(),
            custom_success_patterns: Vec::new(),
        }
    }
}

impl ResponseValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_content_length(mut self, min_content_length: usize) -> Self {
        self.min_content_length = min_content_length;
        self
    }

    pub fn with_custom_block_patterns(mut self, patterns: Vec<String>) -> Self {
        self.custom_block_patterns = patterns.into_iter().map(|p| p.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_custom_success_patterns(mut self, patterns: Vec<String>) -> Self {
        self.custom_success_patterns = patterns.into_iter().map(|p| p.to_ascii_lowercase()).collect();
        self
    }

    /// Classifies a navigation outcome given its response metadata and the
    /// already-fetched page body. First match wins, in the order documented
    /// on the module.
    pub fn validate(&self, response: Option<&NavigationResponse>, body: &str) -> ValidationResult {
        let response = match response {
            Some(r) => r,
            None => return ValidationResult::blocked("navigation_failed"),
        };

        let body_lower = body.to_ascii_lowercase();

        if let Some(status) = response.status
            && matches!(status, 403 | 429 | 503)
        {
            let blocked_by = status_blocked_by(&response.headers);
            let mut result = ValidationResult::blocked(format!("status_{status}"));
            result.http_status = Some(status);
            result.blocked_by = blocked_by;
            return result;
        }

        if let Some(pattern) = matches_any(&body_lower, CLOUDFLARE_PATTERNS) {
            let mut result = ValidationResult::blocked("cloudflare");
            result.pattern = Some(pattern.to_string());
            return result;
        }

        if let Some(pattern) = matches_any(&body_lower, CAPTCHA_PATTERNS) {
            let mut result = ValidationResult::blocked("captcha");
            result.pattern = Some(pattern.to_string());
            return result;
        }

        if let Some(pattern) = matches_any(&body_lower, RATE_LIMIT_PATTERNS) {
            let mut result = ValidationResult::blocked("rate_limit");
            result.pattern = Some(pattern.to_string());
            return result;
        }

        let custom_block = self
            .custom_block_patterns
            .iter()
            .find(|p| body_lower.contains(p.as_str()));
        if let Some(pattern) = custom_block {
            let has_success_override = self
                .custom_success_patterns
                .iter()
                .any(|p| body_lower.contains(p.as_str()));
            if !has_success_override {
                let mut result = ValidationResult::blocked("custom_block");
                result.pattern = Some(pattern.clone());
                return result;
            }
        }

        if let Some(pattern) = matches_any(&body_lower, LOGIN_WALL_PATTERNS) {
            let mut result = ValidationResult::ok();
            result.reason = Some("login_required".to_string());
            result.pattern = Some(pattern.to_string());
            return result;
        }

        if body.len() < self.min_content_length && !is_expected_short_page(body) {
            return ValidationResult::blocked("content_too_short");
        }

        ValidationResult::ok()
    }

    fn _is_expected_short_page(&self, body: &str) -> bool {
        is_expected_short_page(body)
    }
}

/// Convenience wrapper for callers that don't need a reusable validator.
pub fn validate_response(response: Option<&NavigationResponse>, body: &str) -> ValidationResult {
    ResponseValidator::new().validate(response, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)]) -> NavigationResponse {
        NavigationResponse {
            status: Some(status),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn navigation_failed_when_no_response() {
        let validator = ResponseValidator::new();
        let result = validator.validate(None, "<html></html>");
        assert!(result.blocked);
        assert_eq!(result.reason.as_deref(), Some("navigation_failed"));
    }

    #[test]
    fn cloudfront_403_is_blocked() {
        let validator = ResponseValidator::new();
        let resp = response(403, &[("x-amz-cf-id", "abc123")]);
        let result = validator.validate(Some(&resp), "<html>Access Denied</html>");
        assert!(result.blocked);
        assert_eq!(result.blocked_by, Some(BlockedBy::Cloudfront));
        assert_eq!(result.reason.as_deref(), Some("status_403"));
    }

    #[test]
    fn cloudfront_pop_header_detected() {
        let validator = ResponseValidator::new();
        let resp = response(403, &[("x-amz-cf-pop", "IAD50-C1")]);
        let result = validator.validate(Some(&resp), "<html>Forbidden</html>");
        assert_eq!(result.blocked_by, Some(BlockedBy::Cloudfront));
    }

    #[test]
    fn akamai_header_detected() {
        let validator = ResponseValidator::new();
        let resp = response(403, &[("x-akamai-request-id", "def456")]);
        let result = validator.validate(Some(&resp), "<html>Access Denied</html>");
        assert_eq!(result.blocked_by, Some(BlockedBy::Akamai));
    }

    #[test]
    fn cloudflare_challenge_body_detected() {
        let validator = ResponseValidator::new();
        let resp = response(200, &[]);
        let result = validator.validate(Some(&resp), "Just a moment... checking your browser");
        assert!(result.blocked);
        assert_eq!(result.reason.as_deref(), Some("cloudflare"));
    }

    #[test]
    fn captcha_body_detected() {
        let validator = ResponseValidator::new();
        let resp = response(200, &[]);
        let result = validator.validate(Some(&resp), "Please complete the captcha to continue");
        assert!(result.blocked);
        assert_eq!(result.reason.as_deref(), Some("captcha"));
    }

    #[test]
    fn rate_limit_status_and_body() {
        let validator = ResponseValidator::new();
        let resp = response(429, &[]);
        let result = validator.validate(Some(&resp), "Too many requests");
        assert!(result.blocked);
        assert!(result.reason.as_deref().unwrap().contains("429"));
    }

    #[test]
    fn login_wall_is_not_blocked() {
        let validator = ResponseValidator::new();
        let resp = response(200, &[]);
        let result = validator.validate(Some(&resp), "<h1>Sign in to continue</h1><p>You need to log in.</p>");
        assert!(!result.blocked);
        assert_eq!(result.reason.as_deref(), Some("login_required"));
    }

    #[test]
    fn custom_block_pattern_blocks() {
        let validator = ResponseValidator::new().with_custom_block_patterns(vec!["custom block message".into()]);
        let resp = response(200, &[]);
        let result = validator.validate(Some(&resp), "CUSTOM BLOCK MESSAGE HERE");
        assert!(result.blocked);
        assert_eq!(result.reason.as_deref(), Some("custom_block"));
    }

    #[test]
    fn custom_success_pattern_overrides_custom_block() {
        let validator = ResponseValidator::new()
            .with_custom_block_patterns(vec!["just a moment".into()])
            .with_custom_success_patterns(vec!["success_marker".into()]);
        let resp = response(200, &[]);
        let result = validator.validate(Some(&resp), "Just a moment SUCCESS_MARKER");
        assert!(!result.blocked);
    }

    #[test]
    fn json_body_is_expected_short() {
        assert!(is_expected_short_page(r#"{"status": "ok"}"#));
        assert!(is_expected_short_page("[1, 2, 3]"));
    }

    #[test]
    fn meta_refresh_is_expected_short() {
        let body = r#"<html><head><meta http-equiv="refresh" content="0;url=/new"></head></html>"#;
        assert!(is_expected_short_page(body));
    }

    #[test]
    fn minimal_body_is_expected_short() {
        assert!(is_expected_short_page("<html><head></head><body></body></html>"));
    }

    #[test]
    fn dense_body_is_not_expected_short() {
        let body = format!("<html><head></head><body>{}</body></html>", "<div>x</div>".repeat(30));
        assert!(!is_expected_short_page(&body));
    }

    #[test]
    fn short_json_passes_even_with_high_min_length() {
        let validator = ResponseValidator::new().with_min_content_length(1000);
        let resp = response(200, &[]);
        let result = validator.validate(Some(&resp), r#"{"status": "ok"}"#);
        assert!(!result.blocked);
    }

    #[test]
    fn short_normal_content_is_blocked() {
        let body = "<html><head></head><body>".to_string()
            + &"<div>word</div>".repeat(20)
            + "</body></html>";
        let validator = ResponseValidator::new().with_min_content_length(10_000);
        let resp = response(200, &[]);
        let result = validator.validate(Some(&resp), &body);
        assert!(result.blocked);
        assert_eq!(result.reason.as_deref(), Some("content_too_short"));
    }

    #[test]
    fn normal_200_page_passes() {
        let validator = ResponseValidator::new();
        let resp = response(200, &[]);
        let result = validator.validate(
            Some(&resp),
            "<html><body><h1>Welcome</h1><p>Content here that is real</p></body></html>",
        );
        assert!(!result.blocked);
    }
}
