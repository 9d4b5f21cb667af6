//! Single-URL and batch capture orchestration: ties `CaptureService`
//! together with `DomainLearner` and `TrainingService` so every capture
//! feeds the bandit and (when selectors are supplied) the training store.
//!
//! Grounded on `original_source/services/scraper/base.py` (outcome feedback
//! into `TrainingService` after each extraction) and the vendored reference
//! crate's MCP tool-call style of wrapping a multi-step pipeline behind one
//! entry point, adapted away from MCP-specific request/response types.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::core::models::{BlockedBy, CaptureResult, OutcomeType};
use crate::core::progress::ProgressState;
use crate::services::capture::{CaptureOptions, CaptureService};
use crate::services::learning::{DomainLearner, LearnerError, OutcomeDetails};

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("invalid url {0:?}: no host")]
    NoHost(String),
    #[error("learning error: {0}")]
    Learner(#[from] LearnerError),
}

pub type ScraperResult<T> = Result<T, ScraperError>;

fn extract_domain(url: &str) -> ScraperResult<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| ScraperError::NoHost(url.to_string()))
}

/// Maps a finished capture to the outcome taxonomy `DomainLearner` trains
/// on, following the precedence the validator itself uses (blocked reasons
/// take priority over empty-content, which takes priority over plain
/// success/error).
fn classify_outcome(result: &CaptureResult) -> (OutcomeType, Option<BlockedBy>) {
    if let Some(validation) = &result.validation {
        if validation.blocked {
            let outcome = match validation.reason.as_deref() {
                Some("captcha") => OutcomeType::Captcha,
                Some("rate_limit") | Some("status_429") => OutcomeType::RateLimited,
                Some("navigation_failed") => OutcomeType::Timeout,
                _ => OutcomeType::Blocked403,
            };
            return (outcome, validation.blocked_by);
        }
    }

    if !result.success {
        return (OutcomeType::Error, None);
    }

    if result.word_count == 0 {
        return (OutcomeType::ContentEmpty, None);
    }

    (OutcomeType::Success, None)
}

fn outcome_details(result: &CaptureResult) -> OutcomeDetails {
    let (outcome, blocked_by) = classify_outcome(result);
    let has_captcha = outcome == OutcomeType::Captcha;
    let has_login_wall = result.validation.as_ref().and_then(|v| v.reason.as_deref()) == Some("login_required");

    OutcomeDetails {
        url: result.url.clone(),
        http_status: result.validation.as_ref().and_then(|v| v.http_status),
        outcome,
        blocked_by,
        content_extracted: result.word_count > 0,
        content_length: result.word_count,
        page_title: result.page_title.clone(),
        has_captcha,
        has_login_wall,
        response_time_ms: result.duration_ms,
    }
}

/// Ties `CaptureService` to `DomainLearner`: each capture draws its
/// `BrowserConfig` from the bandit and feeds the outcome back in.
pub struct ScraperService {
    capture: CaptureService,
    learner: DomainLearner,
}

impl ScraperService {
    pub fn new(capture: CaptureService, learner: DomainLearner) -> Self {
        Self { capture, learner }
    }

    /// Captures one URL, using the domain's current best-known
    /// configuration and recording the outcome back into the learner.
    pub async fn capture_url(&self, url: &str, options: &CaptureOptions) -> ScraperResult<CaptureResult> {
        let domain = extract_domain(url)?;
        let config = self.learner.get_best_config(&domain).await?;
        let result = self.capture.capture(url, &config, options).await;

        let details = outcome_details(&result);
        if let Err(e) = self.learner.record_outcome(&domain, &config, result.success, &details).await {
            warn!("failed to record learning outcome for {domain}: {e}");
        }

        Ok(result)
    }

    /// Captures a list of URLs with up to `concurrency` captures in flight,
    /// reporting progress through `progress` as each one completes.
    pub async fn capture_batch(
        &self,
        urls: &[String],
        options: &CaptureOptions,
        concurrency: usize,
        progress: Arc<Mutex<ProgressState>>,
    ) -> Vec<CaptureResult> {
        stream::iter(urls.iter().cloned())
            .map(|url| {
                let options = options.clone();
                let progress = Arc::clone(&progress);
                async move {
                    progress.lock().start_item(url.clone());
                    let outcome = self.capture_url(&url, &options).await;
                    let result = match outcome {
                        Ok(result) => result,
                        Err(e) => {
                            let mut result = CaptureResult::new(&url);
                            result.error = Some(e.to_string());
                            result
                        }
                    };
                    let bytes = result
                        .screenshot_path
                        .iter()
                        .chain(result.pdf_path.iter())
                        .chain(result.html_path.iter())
                        .chain(result.warc_path.iter())
                        .count() as u64;
                    progress.lock().complete_item(result.success, bytes);
                    result
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ValidationResult;

    #[test]
    fn classify_outcome_success_with_content() {
        let mut result = CaptureResult::new("https://example.com");
        result.success = true;
        result.word_count = 120;
        assert_eq!(classify_outcome(&result).0, OutcomeType::Success);
    }

    #[test]
    fn classify_outcome_empty_content() {
        let mut result = CaptureResult::new("https://example.com");
        result.success = true;
        result.word_count = 0;
        assert_eq!(classify_outcome(&result).0, OutcomeType::ContentEmpty);
    }

    #[test]
    fn classify_outcome_captcha_blocked() {
        let mut result = CaptureResult::new("https://example.com");
        result.validation = Some(ValidationResult::blocked("captcha"));
        assert_eq!(classify_outcome(&result).0, OutcomeType::Captcha);
    }

    #[test]
    fn classify_outcome_rate_limited() {
        let mut result = CaptureResult::new("https://example.com");
        result.validation = Some(ValidationResult::blocked("rate_limit"));
        assert_eq!(classify_outcome(&result).0, OutcomeType::RateLimited);
    }

    #[test]
    fn classify_outcome_status_403_maps_blocked() {
        let mut result = CaptureResult::new("https://example.com");
        let mut validation = ValidationResult::blocked("status_403");
        validation.blocked_by = Some(BlockedBy::Cloudfront);
        result.validation = Some(validation);
        let (outcome, blocked_by) = classify_outcome(&result);
        assert_eq!(outcome, OutcomeType::Blocked403);
        assert_eq!(blocked_by, Some(BlockedBy::Cloudfront));
    }

    #[test]
    fn extract_domain_rejects_hostless_url() {
        assert!(extract_domain("not a url").is_err());
    }

    #[test]
    fn extract_domain_returns_host() {
        assert_eq!(extract_domain("https://bandcamp.com/album/x").unwrap(), "bandcamp.com");
    }
}
