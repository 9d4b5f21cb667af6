//! The Store: a single SQLite file holding every persistent table the core
//! subsystems share. WAL journaling lets workers and the CLI read concurrently
//! while a worker holds a short write transaction.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;

/// Schema version written to `schema_meta` on first initialization.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("schema version mismatch: store has {found}, expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ten logical tables plus `schema_meta`:
/// `browser_configs`, `domain_arms`, `request_outcomes`, `domain_similarity`,
/// `jobs`, `job_dead_letter`, `selector_patterns`, `url_patterns`,
/// `web_sources`, `web_source_images`.
///
/// `domain_arms` is named distinctly from the original's `domain_configs` to
/// avoid that table name doing double duty as both the narrow bandit-arm
/// schema and a wide per-domain hints schema (see DESIGN.md, Open Question
/// on the DomainArm schema split) — only the narrow form is implemented.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS browser_configs (
    config_id TEXT PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    headless_mode TEXT DEFAULT 'shell',
    user_agent TEXT,
    viewport_width INTEGER DEFAULT 1920,
    viewport_height INTEGER DEFAULT 1080,
    stealth_enabled INTEGER DEFAULT 1,
    disable_automation_flag INTEGER DEFAULT 1,
    wait_strategy TEXT DEFAULT 'networkidle',
    default_timeout_ms INTEGER DEFAULT 30000,
    total_attempts INTEGER DEFAULT 0,
    success_count INTEGER DEFAULT 0,
    last_success TEXT,
    last_failure TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS domain_arms (
    domain TEXT NOT NULL,
    config_key TEXT NOT NULL,
    success_count INTEGER DEFAULT 0,
    failure_count INTEGER DEFAULT 0,
    last_used TEXT,
    PRIMARY KEY (domain, config_key)
);
CREATE INDEX IF NOT EXISTS idx_domain_arms_domain ON domain_arms(domain);

CREATE TABLE IF NOT EXISTS request_outcomes (
    outcome_id TEXT PRIMARY KEY,
    timestamp TEXT DEFAULT CURRENT_TIMESTAMP,
    domain TEXT NOT NULL,
    url TEXT NOT NULL,
    tld TEXT NOT NULL,
    config_id TEXT,
    user_agent TEXT,
    headless_mode TEXT,
    stealth_enabled INTEGER,
    http_status INTEGER,
    outcome TEXT,
    blocked_by TEXT,
    content_extracted INTEGER DEFAULT 0,
    content_length INTEGER DEFAULT 0,
    page_title TEXT,
    has_captcha INTEGER DEFAULT 0,
    has_login_wall INTEGER DEFAULT 0,
    response_time_ms INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_outcomes_domain ON request_outcomes(domain);
CREATE INDEX IF NOT EXISTS idx_outcomes_outcome ON request_outcomes(outcome);
CREATE INDEX IF NOT EXISTS idx_outcomes_timestamp ON request_outcomes(timestamp);

CREATE TABLE IF NOT EXISTS domain_similarity (
    domain_a TEXT NOT NULL,
    domain_b TEXT NOT NULL,
    similarity_score REAL,
    similarity_type TEXT,
    PRIMARY KEY (domain_a, domain_b)
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    priority INTEGER DEFAULT 0,
    status TEXT DEFAULT 'pending',
    payload TEXT,
    depends_on TEXT,
    retry_count INTEGER DEFAULT 0,
    error TEXT,
    result TEXT,
    scheduled_for TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, priority DESC, scheduled_for ASC);

CREATE TABLE IF NOT EXISTS job_dead_letter (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    payload TEXT,
    error TEXT,
    retry_count INTEGER,
    original_created_at TEXT,
    failed_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS selector_patterns (
    pattern_id TEXT PRIMARY KEY,
    site TEXT NOT NULL,
    field TEXT NOT NULL,
    selector TEXT NOT NULL,
    selector_type TEXT DEFAULT 'css',
    success_count INTEGER DEFAULT 0,
    failure_count INTEGER DEFAULT 0,
    last_used TEXT,
    last_value TEXT,
    UNIQUE(site, field, selector)
);
CREATE INDEX IF NOT EXISTS idx_selectors_site ON selector_patterns(site);

CREATE TABLE IF NOT EXISTS url_patterns (
    pattern_id TEXT PRIMARY KEY,
    site TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    pattern TEXT NOT NULL,
    success_count INTEGER DEFAULT 0,
    failure_count INTEGER DEFAULT 0,
    last_used TEXT,
    example_source TEXT,
    example_result TEXT,
    UNIQUE(site, pattern_type, pattern)
);
CREATE INDEX IF NOT EXISTS idx_url_patterns_site ON url_patterns(site);

CREATE TABLE IF NOT EXISTS web_sources (
    source_id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    status TEXT DEFAULT 'pending',
    archive_method TEXT,
    screenshot_path TEXT,
    pdf_path TEXT,
    html_path TEXT,
    warc_path TEXT,
    wacz_path TEXT,
    title TEXT,
    description TEXT,
    metadata TEXT,
    word_count INTEGER DEFAULT 0,
    image_count INTEGER DEFAULT 0,
    video_count INTEGER DEFAULT 0,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_sources_url ON web_sources(url);
CREATE INDEX IF NOT EXISTS idx_sources_status ON web_sources(status);

CREATE TABLE IF NOT EXISTS web_source_images (
    image_id TEXT PRIMARY KEY,
    source_id TEXT REFERENCES web_sources(source_id),
    original_url TEXT NOT NULL,
    enhanced_url TEXT,
    content_hash TEXT,
    width INTEGER,
    height INTEGER,
    enhancement_method TEXT
);
CREATE INDEX IF NOT EXISTS idx_source_images_source ON web_source_images(source_id);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT
);
"#;

/// Owns the pooled SQLite connection. Every other component takes a `Store`
/// handle (by `Arc` or clone — `SqlitePool` is already cheaply cloneable) at
/// construction; there is no process-wide database singleton.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the database at `path`, apply the schema,
    /// and check/record the schema version.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests; schema is still applied.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Memory);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT value FROM schema_meta WHERE key = 'version'")
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            None => {
                sqlx::query("INSERT INTO schema_meta (key, value) VALUES ('version', ?)")
                    .bind(SCHEMA_VERSION.to_string())
                    .execute(&self.pool)
                    .await?;
            }
            Some((value,)) => {
                let found: i64 = value.parse().unwrap_or(0);
                if found != SCHEMA_VERSION {
                    return Err(StoreError::SchemaMismatch {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn schema_version(&self) -> StoreResult<i64> {
        let row: (String,) = sqlx::query_as("SELECT value FROM schema_meta WHERE key = 'version'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.parse().unwrap_or(0))
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_initializes_schema() {
        let store = Store::open_in_memory().await.expect("store should open");
        assert_eq!(
            store.schema_version().await.expect("version should read back"),
            SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.sqlite");
        let first = Store::open(&path).await.expect("first open should succeed");
        drop(first);
        let second = Store::open(&path).await.expect("second open should succeed");
        assert_eq!(second.schema_version().await.expect("version"), SCHEMA_VERSION);
    }
}
