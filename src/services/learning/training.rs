//! Confidence-ranked selector and URL-pattern learner: tracks per-site,
//! per-field extractor success rates and exposes best/fallback queries plus
//! a merge-or-replace import/export pair.
//!
//! Grounded on `original_source/services/scraper/training.py` (`TrainingService`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::database::{Store, StoreError};
use crate::core::models::{SelectorPattern, UrlPattern};

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("timestamp parse error: {0}")]
    Chrono(#[from] chrono::ParseError),
}

pub type TrainingResult<T> = Result<T, TrainingError>;

#[derive(sqlx::FromRow)]
struct SelectorRow {
    pattern_id: String,
    site: String,
    field: String,
    selector: String,
    selector_type: String,
    success_count: i64,
    failure_count: i64,
    last_used: Option<String>,
    last_value: Option<String>,
}

fn parse_dt_opt(s: Option<&str>) -> TrainingResult<Option<chrono::DateTime<Utc>>> {
    s.map(|s| chrono::DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))).transpose().map_err(Into::into)
}

impl SelectorRow {
    fn into_pattern(self) -> TrainingResult<SelectorPattern> {
        Ok(SelectorPattern {
            pattern_id: self.pattern_id,
            site: self.site,
            field: self.field,
            selector: self.selector,
            selector_type: self.selector_type,
            success_count: self.success_count as u64,
            failure_count: self.failure_count as u64,
            last_used: parse_dt_opt(self.last_used.as_deref())?,
            last_value: self.last_value,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UrlPatternRow {
    pattern_id: String,
    site: String,
    pattern_type: String,
    pattern: String,
    success_count: i64,
    failure_count: i64,
    last_used: Option<String>,
    example_source: Option<String>,
    example_result: Option<String>,
}

impl UrlPatternRow {
    fn into_pattern(self) -> TrainingResult<UrlPattern> {
        Ok(UrlPattern {
            pattern_id: self.pattern_id,
            site: self.site,
            pattern_type: self.pattern_type,
            pattern: self.pattern,
            success_count: self.success_count as u64,
            failure_count: self.failure_count as u64,
            last_used: parse_dt_opt(self.last_used.as_deref())?,
            example_source: self.example_source,
            example_result: self.example_result,
        })
    }
}

/// Two-section export document: `selectors` and `url_patterns`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingExport {
    pub selectors: Vec<SelectorPattern>,
    pub url_patterns: Vec<UrlPattern>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportCounts {
    pub selectors: usize,
    pub url_patterns: usize,
}

pub struct TrainingService {
    store: Store,
}

impl TrainingService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn record_selector_outcome(
        &self,
        site: &str,
        field: &str,
        selector: &str,
        success: bool,
        extracted_value: Option<&str>,
    ) -> TrainingResult<()> {
        let now = Utc::now().to_rfc3339();
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT pattern_id FROM selector_patterns WHERE site = ? AND field = ? AND selector = ?")
                .bind(site)
                .bind(field)
                .bind(selector)
                .fetch_optional(self.store.pool())
                .await?;

        if existing.is_some() {
            if success {
                sqlx::query(
                    "UPDATE selector_patterns SET success_count = success_count + 1, last_used = ?, last_value = ? \
                     WHERE site = ? AND field = ? AND selector = ?",
                )
                .bind(&now)
                .bind(extracted_value)
                .bind(site)
                .bind(field)
                .bind(selector)
                .execute(self.store.pool())
                .await?;
            } else {
                sqlx::query(
                    "UPDATE selector_patterns SET failure_count = failure_count + 1, last_used = ? \
                     WHERE site = ? AND field = ? AND selector = ?",
                )
                .bind(&now)
                .bind(site)
                .bind(field)
                .bind(selector)
                .execute(self.store.pool())
                .await?;
            }
        } else {
            sqlx::query(
                "INSERT INTO selector_patterns (pattern_id, site, field, selector, success_count, failure_count, last_used, last_value) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(site)
            .bind(field)
            .bind(selector)
            .bind(success as i64)
            .bind((!success) as i64)
            .bind(&now)
            .bind(if success { extracted_value } else { None })
            .execute(self.store.pool())
            .await?;
        }
        Ok(())
    }

    /// Highest-confidence pattern above `min_confidence`, ties broken by
    /// raw success count.
    pub async fn best_selector(&self, site: &str, field: &str, min_confidence: f64) -> TrainingResult<Option<SelectorPattern>> {
        let rows = self.selectors_for_site_query(site, Some(field), 0.0).await?;
        Ok(rows
            .into_iter()
            .filter(|p| p.confidence() >= min_confidence)
            .max_by(|a, b| a.confidence().partial_cmp(&b.confidence()).unwrap().then(a.success_count.cmp(&b.success_count))))
    }

    pub async fn fallback_selectors(&self, site: &str, field: &str, limit: usize) -> TrainingResult<Vec<SelectorPattern>> {
        let mut rows = self.selectors_for_site_query(site, Some(field), 0.0).await?;
        rows.sort_by(|a, b| b.confidence().partial_cmp(&a.confidence()).unwrap().then(b.success_count.cmp(&a.success_count)));
        rows.truncate(limit);
        Ok(rows)
    }

    pub async fn selectors_for_site(&self, site: &str, min_confidence: f64) -> TrainingResult<Vec<SelectorPattern>> {
        let mut rows = self.selectors_for_site_query(site, None, min_confidence).await?;
        rows.sort_by(|a, b| a.field.cmp(&b.field).then(b.confidence().partial_cmp(&a.confidence()).unwrap()));
        Ok(rows)
    }

    async fn selectors_for_site_query(&self, site: &str, field: Option<&str>, min_confidence: f64) -> TrainingResult<Vec<SelectorPattern>> {
        let rows: Vec<SelectorRow> = if let Some(field) = field {
            sqlx::query_as("SELECT * FROM selector_patterns WHERE site = ? AND field = ? AND (success_count + failure_count) > 0")
                .bind(site)
                .bind(field)
                .fetch_all(self.store.pool())
                .await?
        } else {
            sqlx::query_as("SELECT * FROM selector_patterns WHERE site = ? AND (success_count + failure_count) > 0")
                .bind(site)
                .fetch_all(self.store.pool())
                .await?
        };
        rows.into_iter()
            .map(SelectorRow::into_pattern)
            .collect::<TrainingResult<Vec<_>>>()
            .map(|patterns| patterns.into_iter().filter(|p| p.confidence() >= min_confidence).collect())
    }

    pub async fn record_url_pattern_outcome(
        &self,
        site: &str,
        pattern_type: &str,
        pattern: &str,
        success: bool,
        source_url: Option<&str>,
        result_url: Option<&str>,
    ) -> TrainingResult<()> {
        let now = Utc::now().to_rfc3339();
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT pattern_id FROM url_patterns WHERE site = ? AND pattern_type = ? AND pattern = ?")
                .bind(site)
                .bind(pattern_type)
                .bind(pattern)
                .fetch_optional(self.store.pool())
                .await?;

        if existing.is_some() {
            if success {
                sqlx::query(
                    "UPDATE url_patterns SET success_count = success_count + 1, last_used = ?, \
                       example_source = COALESCE(?, example_source), example_result = COALESCE(?, example_result) \
                     WHERE site = ? AND pattern_type = ? AND pattern = ?",
                )
                .bind(&now)
                .bind(source_url)
                .bind(result_url)
                .bind(site)
                .bind(pattern_type)
                .bind(pattern)
                .execute(self.store.pool())
                .await?;
            } else {
                sqlx::query(
                    "UPDATE url_patterns SET failure_count = failure_count + 1, last_used = ? \
                     WHERE site = ? AND pattern_type = ? AND pattern = ?",
                )
                .bind(&now)
                .bind(site)
                .bind(pattern_type)
                .bind(pattern)
                .execute(self.store.pool())
                .await?;
            }
        } else {
            sqlx::query(
                "INSERT INTO url_patterns (pattern_id, site, pattern_type, pattern, success_count, failure_count, last_used, example_source, example_result) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(site)
            .bind(pattern_type)
            .bind(pattern)
            .bind(success as i64)
            .bind((!success) as i64)
            .bind(&now)
            .bind(if success { source_url } else { None })
            .bind(if success { result_url } else { None })
            .execute(self.store.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn best_url_pattern(&self, site: &str, pattern_type: &str, min_confidence: f64) -> TrainingResult<Option<UrlPattern>> {
        let rows: Vec<UrlPatternRow> =
            sqlx::query_as("SELECT * FROM url_patterns WHERE site = ? AND pattern_type = ? AND (success_count + failure_count) > 0")
                .bind(site)
                .bind(pattern_type)
                .fetch_all(self.store.pool())
                .await?;
        let patterns = rows.into_iter().map(UrlPatternRow::into_pattern).collect::<TrainingResult<Vec<_>>>()?;
        Ok(patterns
            .into_iter()
            .filter(|p| p.confidence() >= min_confidence)
            .max_by(|a, b| a.confidence().partial_cmp(&b.confidence()).unwrap().then(a.success_count.cmp(&b.success_count))))
    }

    /// Exports all rows, optionally filtered by `site`.
    pub async fn export_training_data(&self, site: Option<&str>) -> TrainingResult<TrainingExport> {
        let selector_rows: Vec<SelectorRow> = match site {
            Some(site) => sqlx::query_as("SELECT * FROM selector_patterns WHERE site = ?").bind(site).fetch_all(self.store.pool()).await?,
            None => sqlx::query_as("SELECT * FROM selector_patterns").fetch_all(self.store.pool()).await?,
        };
        let url_rows: Vec<UrlPatternRow> = match site {
            Some(site) => sqlx::query_as("SELECT * FROM url_patterns WHERE site = ?").bind(site).fetch_all(self.store.pool()).await?,
            None => sqlx::query_as("SELECT * FROM url_patterns").fetch_all(self.store.pool()).await?,
        };

        Ok(TrainingExport {
            selectors: selector_rows.into_iter().map(SelectorRow::into_pattern).collect::<TrainingResult<_>>()?,
            url_patterns: url_rows.into_iter().map(UrlPatternRow::into_pattern).collect::<TrainingResult<_>>()?,
        })
    }

    /// `merge=true` upserts and adds counts; `merge=false` replaces all rows
    /// wholesale inside one transaction.
    pub async fn import_training_data(&self, data: &TrainingExport, merge: bool) -> TrainingResult<ImportCounts> {
        let mut tx = self.store.pool().begin().await?;
        let mut counts = ImportCounts::default();

        if !merge {
            sqlx::query("DELETE FROM selector_patterns").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM url_patterns").execute(&mut *tx).await?;
        }

        for selector in &data.selectors {
            let last_used = selector.last_used.map(|dt| dt.to_rfc3339()).unwrap_or_else(|| Utc::now().to_rfc3339());
            if merge {
                sqlx::query(
                    "INSERT INTO selector_patterns (pattern_id, site, field, selector, selector_type, success_count, failure_count, last_used, last_value) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(site, field, selector) DO UPDATE SET \
                       success_count = success_count + excluded.success_count, \
                       failure_count = failure_count + excluded.failure_count, \
                       last_used = excluded.last_used",
                )
            } else {
                sqlx::query(
                    "INSERT INTO selector_patterns (pattern_id, site, field, selector, selector_type, success_count, failure_count, last_used, last_value) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
            }
            .bind(&selector.pattern_id)
            .bind(&selector.site)
            .bind(&selector.field)
            .bind(&selector.selector)
            .bind(&selector.selector_type)
            .bind(selector.success_count as i64)
            .bind(selector.failure_count as i64)
            .bind(&last_used)
            .bind(&selector.last_value)
            .execute(&mut *tx)
            .await?;
            counts.selectors += 1;
        }

        for pattern in &data.url_patterns {
            let last_used = pattern.last_used.map(|dt| dt.to_rfc3339()).unwrap_or_else(|| Utc::now().to_rfc3339());
            if merge {
                sqlx::query(
                    "INSERT INTO url_patterns (pattern_id, site, pattern_type, pattern, success_count, failure_count, last_used, example_source, example_result) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(site, pattern_type, pattern) DO UPDATE SET \
                       success_count = success_count + excluded.success_count, \
                       failure_count = failure_count + excluded.failure_count, \
                       last_used = excluded.last_used",
                )
            } else {
                sqlx::query(
                    "INSERT INTO url_patterns (pattern_id, site, pattern_type, pattern, success_count, failure_count, last_used, example_source, example_result) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
            }
            .bind(&pattern.pattern_id)
            .bind(&pattern.site)
            .bind(&pattern.pattern_type)
            .bind(&pattern.pattern)
            .bind(pattern.success_count as i64)
            .bind(pattern.failure_count as i64)
            .bind(&last_used)
            .bind(&pattern.example_source)
            .bind(&pattern.example_result)
            .execute(&mut *tx)
            .await?;
            counts.url_patterns += 1;
        }

        tx.commit().await?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_service() -> TrainingService {
        let store = Store::open_in_memory().await.unwrap();
        TrainingService::new(store)
    }

    #[tokio::test]
    async fn record_and_fetch_best_selector() {
        let service = test_service().await;
        service.record_selector_outcome("bandcamp.com", "title", "h1.title", true, Some("Album Name")).await.unwrap();
        service.record_selector_outcome("bandcamp.com", "title", "h1.title", true, Some("Album Name")).await.unwrap();
        service.record_selector_outcome("bandcamp.com", "title", ".fallback", true, Some("x")).await.unwrap();
        service.record_selector_outcome("bandcamp.com", "title", ".fallback", false, None).await.unwrap();

        let best = service.best_selector("bandcamp.com", "title", 0.5).await.unwrap().unwrap();
        assert_eq!(best.selector, "h1.title");
        assert_eq!(best.success_count, 2);
    }

    #[tokio::test]
    async fn best_selector_respects_min_confidence() {
        let service = test_service().await;
        service.record_selector_outcome("x.com", "artist", ".low", true, None).await.unwrap();
        service.record_selector_outcome("x.com", "artist", ".low", false, None).await.unwrap();
        service.record_selector_outcome("x.com", "artist", ".low", false, None).await.unwrap();

        assert!(service.best_selector("x.com", "artist", 0.5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fallback_selectors_ordered_by_confidence() {
        let service = test_service().await;
        service.record_selector_outcome("site.com", "f", ".a", true, None).await.unwrap();
        service.record_selector_outcome("site.com", "f", ".b", true, None).await.unwrap();
        service.record_selector_outcome("site.com", "f", ".b", true, None).await.unwrap();

        let fallbacks = service.fallback_selectors("site.com", "f", 5).await.unwrap();
        assert_eq!(fallbacks[0].selector, ".b");
    }

    #[tokio::test]
    async fn url_pattern_roundtrip() {
        let service = test_service().await;
        service.record_url_pattern_outcome("bandcamp.com", "image_url", "{id}_10.jpg", true, Some("src"), Some("dst")).await.unwrap();

        let best = service.best_url_pattern("bandcamp.com", "image_url", 0.5).await.unwrap().unwrap();
        assert_eq!(best.pattern, "{id}_10.jpg");
        assert_eq!(best.example_result.as_deref(), Some("dst"));
    }

    #[tokio::test]
    async fn export_then_import_merge_preserves_counts() {
        let service = test_service().await;
        service.record_selector_outcome("a.com", "f", ".s", true, None).await.unwrap();
        let exported = service.export_training_data(None).await.unwrap();
        assert_eq!(exported.selectors.len(), 1);

        let counts = service.import_training_data(&exported, true).await.unwrap();
        assert_eq!(counts.selectors, 1);

        let best = service.best_selector("a.com", "f", 0.0).await.unwrap().unwrap();
        assert_eq!(best.success_count, 2, "merge import should add onto the existing row");
    }

    #[tokio::test]
    async fn import_replace_clears_prior_rows() {
        let service = test_service().await;
        service.record_selector_outcome("old.com", "f", ".old", true, None).await.unwrap();

        let fresh = TrainingExport {
            selectors: vec![SelectorPattern::new("new.com", "f", ".new")],
            url_patterns: vec![],
        };
        service.import_training_data(&fresh, false).await.unwrap();

        assert!(service.selectors_for_site("old.com", 0.0).await.unwrap().is_empty());
    }
}
