//! Core data types shared by every subsystem: jobs, browser configuration,
//! capture results, and the learners' pattern records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Outcome classification for a single browser request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Success,
    Blocked403,
    Captcha,
    Timeout,
    RateLimited,
    ContentEmpty,
    Error,
}

impl OutcomeType {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeType::Success => "success",
            OutcomeType::Blocked403 => "blocked_403",
            OutcomeType::Captcha => "captcha",
            OutcomeType::Timeout => "timeout",
            OutcomeType::RateLimited => "rate_limited",
            OutcomeType::ContentEmpty => "content_empty",
            OutcomeType::Error => "error",
        }
    }
}

/// Known bot-detection services a block can be attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedBy {
    Cloudfront,
    Cloudflare,
    Akamai,
    Imperva,
    Datadome,
    Perimeterx,
    Custom,
}

impl BlockedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockedBy::Cloudfront => "cloudfront",
            BlockedBy::Cloudflare => "cloudflare",
            BlockedBy::Akamai => "akamai",
            BlockedBy::Imperva => "imperva",
            BlockedBy::Datadome => "datadome",
            BlockedBy::Perimeterx => "perimeterx",
            BlockedBy::Custom => "custom",
        }
    }
}

/// Chrome headless launch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadlessMode {
    /// Chrome 129+ `--headless=new` shell mode; least detectable.
    Shell,
    New,
    Visible,
}

impl Default for HeadlessMode {
    fn default() -> Self {
        Self::Shell
    }
}

impl std::fmt::Display for HeadlessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HeadlessMode::Shell => "shell",
            HeadlessMode::New => "new",
            HeadlessMode::Visible => "visible",
        };
        f.write_str(s)
    }
}

/// Page-load wait strategy passed to the browser runtime's `navigate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle")]
    NetworkIdle,
    Commit,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::NetworkIdle
    }
}

impl std::fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WaitStrategy::Load => "load",
            WaitStrategy::DomContentLoaded => "domcontentloaded",
            WaitStrategy::NetworkIdle => "networkidle",
            WaitStrategy::Commit => "commit",
        };
        f.write_str(s)
    }
}

/// Browser user-agent family the DomainLearner samples over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAgentKey {
    ChromeMac,
    ChromeWin,
    FirefoxMac,
    SafariMac,
}

impl UserAgentKey {
    pub const ALL: [UserAgentKey; 4] = [
        UserAgentKey::ChromeMac,
        UserAgentKey::ChromeWin,
        UserAgentKey::FirefoxMac,
        UserAgentKey::SafariMac,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UserAgentKey::ChromeMac => "chrome_mac",
            UserAgentKey::ChromeWin => "chrome_win",
            UserAgentKey::FirefoxMac => "firefox_mac",
            UserAgentKey::SafariMac => "safari_mac",
        }
    }

    /// The literal UA string sent to the browser runtime for this key.
    pub fn user_agent_string(self) -> &'static str {
        match self {
            UserAgentKey::ChromeMac => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
            UserAgentKey::ChromeWin => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
            UserAgentKey::FirefoxMac => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0"
            }
            UserAgentKey::SafariMac => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                 (KHTML, like Gecko) Version/17.2 Safari/605.1.15"
            }
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

/// Background job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Capture,
    Scrape,
    Validate,
    Export,
    Sync,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Capture => "capture",
            JobType::Scrape => "scrape",
            JobType::Validate => "validate",
            JobType::Export => "export",
            JobType::Sync => "sync",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "capture" => JobType::Capture,
            "scrape" => JobType::Scrape,
            "validate" => JobType::Validate,
            "export" => JobType::Export,
            "sync" => JobType::Sync,
            _ => return None,
        })
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

/// Result of validating a navigation response against the bot-detection matrix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub blocked: bool,
    pub reason: Option<String>,
    pub pattern: Option<String>,
    pub details: Option<String>,
    pub http_status: Option<u16>,
    pub blocked_by: Option<BlockedBy>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Browser launch/behavior configuration, one row per `config_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub config_id: String,
    pub name: String,

    pub headless_mode: HeadlessMode,
    pub user_agent: Option<String>,
    pub viewport_width: u32,
    pub viewport_height: u32,

    pub stealth_enabled: bool,
    pub disable_automation_flag: bool,

    pub wait_strategy: WaitStrategy,
    pub default_timeout_ms: u64,

    pub total_attempts: u64,
    pub success_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            config_id: generate_id(),
            name: "default".to_string(),
            headless_mode: HeadlessMode::default(),
            user_agent: None,
            viewport_width: 1920,
            viewport_height: 1080,
            stealth_enabled: true,
            disable_automation_flag: true,
            wait_strategy: WaitStrategy::default(),
            default_timeout_ms: 30_000,
            total_attempts: 0,
            success_count: 0,
            last_success: None,
            last_failure: None,
        }
    }
}

impl BrowserConfig {
    /// Laplace-smoothed success rate; `0.5` with no observations.
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.5
        } else {
            self.success_count as f64 / self.total_attempts as f64
        }
    }
}

/// Audit row appended on every completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub outcome_id: String,
    pub timestamp: DateTime<Utc>,

    pub domain: String,
    pub url: String,
    pub tld: String,

    pub config_id: String,
    pub user_agent: Option<String>,
    pub headless_mode: HeadlessMode,
    pub stealth_enabled: bool,

    pub http_status: Option<u16>,
    pub outcome: OutcomeType,
    pub blocked_by: Option<BlockedBy>,
    pub content_extracted: bool,
    pub content_length: u64,

    pub page_title: Option<String>,
    pub has_captcha: bool,
    pub has_login_wall: bool,
    pub response_time_ms: u64,
}

/// Result of one `CaptureService::capture` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    pub success: bool,
    pub url: String,
    pub timestamp: DateTime<Utc>,

    pub screenshot_path: Option<String>,
    pub pdf_path: Option<String>,
    pub html_path: Option<String>,
    pub warc_path: Option<String>,

    pub page_title: Option<String>,
    pub page_description: Option<String>,
    pub word_count: u64,

    pub image_count: u64,
    pub video_count: u64,

    pub validation: Option<ValidationResult>,

    pub duration_ms: u64,
    pub error: Option<String>,
}

impl CaptureResult {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            success: false,
            url: url.into(),
            timestamp: Utc::now(),
            screenshot_path: None,
            pdf_path: None,
            html_path: None,
            warc_path: None,
            page_title: None,
            page_description: None,
            word_count: 0,
            image_count: 0,
            video_count: 0,
            validation: None,
            duration_ms: 0,
            error: None,
        }
    }
}

/// Counts produced by running the behaviors engine once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorStats {
    pub overlays_dismissed: u32,
    pub scroll_depth: u32,
    pub elements_expanded: u32,
    pub tabs_clicked: u32,
    pub carousel_slides: u32,
    pub comments_loaded: u32,
    pub infinite_scroll_pages: u32,
    pub duration_ms: u64,
}

/// A learned `(site, field, selector)` extraction pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorPattern {
    pub pattern_id: String,
    pub site: String,
    pub field: String,
    pub selector: String,
    pub selector_type: String,

    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_value: Option<String>,
}

impl SelectorPattern {
    pub fn new(site: impl Into<String>, field: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            pattern_id: generate_id(),
            site: site.into(),
            field: field.into(),
            selector: selector.into(),
            selector_type: "css".to_string(),
            success_count: 0,
            failure_count: 0,
            last_used: None,
            last_value: None,
        }
    }

    /// `success / (success + failure)`; `0.0` when no data exists yet.
    pub fn confidence(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// A learned `(site, pattern_type, pattern)` URL-transform pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlPattern {
    pub pattern_id: String,
    pub site: String,
    pub pattern_type: String,
    pub pattern: String,

    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub example_source: Option<String>,
    pub example_result: Option<String>,
}

impl UrlPattern {
    pub fn new(site: impl Into<String>, pattern_type: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            pattern_id: generate_id(),
            site: site.into(),
            pattern_type: pattern_type.into(),
            pattern: pattern.into(),
            success_count: 0,
            failure_count: 0,
            last_used: None,
            example_source: None,
            example_result: None,
        }
    }

    pub fn confidence(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// A unit of work in the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,

    pub status: JobStatus,
    pub priority: i64,
    pub retry_count: u32,

    pub depends_on: Option<String>,
    pub scheduled_for: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(job_type: JobType, payload: serde_json::Value, priority: i64) -> Self {
        let now = Utc::now();
        Self {
            job_id: generate_id(),
            job_type,
            payload,
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            depends_on: None,
            scheduled_for: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// A dead-lettered job, preserved for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub job_id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub error: String,
    pub retry_count: u32,
    pub original_created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

/// One Thompson-Sampling arm: a `(domain, config_key)` pair's observed
/// success/failure counts. `config_key` encodes one axis value, e.g.
/// `"headless_mode=shell"` or `"user_agent=chrome_mac"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainArm {
    pub domain: String,
    pub config_key: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl DomainArm {
    pub fn new(domain: impl Into<String>, config_key: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            config_key: config_key.into(),
            success_count: 0,
            failure_count: 0,
            last_used: None,
        }
    }

    /// Beta distribution parameters for Thompson Sampling: `(alpha, beta)`.
    pub fn beta_params(&self) -> (f64, f64) {
        (self.success_count as f64 + 1.0, self.failure_count as f64 + 1.0)
    }
}

/// A precomputed similarity score between two domains, used for cold-start
/// transfer when a domain has no observations of its own yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSimilarity {
    pub domain_a: String,
    pub domain_b: String,
    pub similarity_score: f64,
    pub similarity_type: String,
}

/// Per-domain rate-limit and behavioral hints accumulated over time.
///
/// Not currently backed by a persisted table: the source this crate is
/// grounded on declares this schema in one place but never writes to it
/// anywhere in the request path, so persisting it here would invent a
/// feature rather than implement one. Kept as a plain data type for a
/// future insights/reporting consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: String,
    pub best_config_id: Option<String>,
    pub confidence: f64,

    pub min_delay_ms: u64,
    pub max_requests_per_minute: u32,

    pub requires_cookies: bool,
    pub cookie_source: Option<String>,

    pub needs_scroll_to_load: bool,
    pub needs_click_to_expand: bool,
    pub has_infinite_scroll: bool,

    pub block_indicators: Vec<String>,
    pub success_indicators: Vec<String>,

    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub sample_count: u64,
}

/// A captured web page and its artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSource {
    pub source_id: String,
    pub url: String,
    pub status: String,
    pub archive_method: Option<String>,

    pub screenshot_path: Option<String>,
    pub pdf_path: Option<String>,
    pub html_path: Option<String>,
    pub warc_path: Option<String>,
    pub wacz_path: Option<String>,

    pub title: Option<String>,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,

    pub word_count: u64,
    pub image_count: u64,
    pub video_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One discovered/enhanced image belonging to a `WebSource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSourceImage {
    pub image_id: String,
    pub source_id: String,
    pub original_url: String,
    pub enhanced_url: Option<String>,
    pub content_hash: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub enhancement_method: Option<String>,
}
