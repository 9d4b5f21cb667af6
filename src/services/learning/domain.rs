//! Thompson-Sampling bandit over `headless_mode × wait_strategy × user_agent`,
//! tracked independently per domain.
//!
//! Grounded on `original_source/services/learning/domain.py` (`DomainLearner`,
//! `ArmStats.sample_beta`, `get_best_config`, `record_outcome`,
//! `_find_similar_domains`, `get_domain_insights`, `get_global_stats`).

use std::collections::HashMap;

use chrono::Utc;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::database::{Store, StoreError};
use crate::core::models::{BlockedBy, BrowserConfig, HeadlessMode, OutcomeType, UserAgentKey, WaitStrategy};

const HEADLESS_MODES: [HeadlessMode; 3] = [HeadlessMode::Shell, HeadlessMode::New, HeadlessMode::Visible];
const WAIT_STRATEGIES: [WaitStrategy; 3] = [WaitStrategy::NetworkIdle, WaitStrategy::DomContentLoaded, WaitStrategy::Load];

#[derive(Debug, Error)]
pub enum LearnerError {
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type LearnerResult<T> = Result<T, LearnerError>;

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Outcome details recorded alongside an arm update, mirroring the columns
/// of the `request_outcomes` audit table.
#[derive(Debug, Clone)]
pub struct OutcomeDetails {
    pub url: String,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisInsight {
    pub key: String,
    pub success_rate: f64,
    pub attempts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainInsights {
    pub domain: String,
    pub total_attempts: u64,
    pub success_rate: f64,
    pub best_headless_mode: Option<AxisInsight>,
    pub best_wait_strategy: Option<AxisInsight>,
    pub best_user_agent: Option<AxisInsight>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigStanding {
    pub config_key: String,
    pub success_rate: f64,
    pub attempts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStanding {
    pub domain: String,
    pub success_rate: f64,
    pub attempts: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_domains: u64,
    pub total_requests: u64,
    pub overall_success_rate: f64,
    pub top_performing_configs: Vec<ConfigStanding>,
    pub problematic_domains: Vec<DomainStanding>,
}

/// Draws one Thompson-Sampling value from `Beta(success + 1, failure + 1)`.
fn sample_beta(success: u64, failure: u64) -> f64 {
    let dist = Beta::new(success as f64 + 1.0, failure as f64 + 1.0).expect("success/failure are non-negative, so alpha/beta are always > 0");
    dist.sample(&mut rand::rng())
}

fn success_rate(success: u64, failure: u64) -> f64 {
    let total = success + failure;
    if total == 0 {
        0.0
    } else {
        success as f64 / total as f64
    }
}

fn pick_best_arm<T: Copy>(options: &[T], stats: &HashMap<String, (u64, u64)>, key_of: impl Fn(T) -> String) -> T {
    options
        .iter()
        .copied()
        .map(|option| {
            let (success, failure) = stats.get(&key_of(option)).copied().unwrap_or((0, 0));
            (option, sample_beta(success, failure))
        })
        .max_by(|a, b| a.1.partial_cmp(&b.1).expect("beta samples are never NaN"))
        .map(|(option, _)| option)
        .expect("option list is never empty")
}

pub struct DomainLearner {
    store: Store,
}

impl DomainLearner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Samples the best option per axis and returns the composed config.
    /// Stealth is always enabled, matching the original.
    pub async fn get_best_config(&self, domain: &str) -> LearnerResult<BrowserConfig> {
        let stats = self.load_domain_stats(domain).await?;

        let headless_mode = pick_best_arm(&HEADLESS_MODES, &stats, |m| format!("headless:{m}"));
        let wait_strategy = pick_best_arm(&WAIT_STRATEGIES, &stats, |w| format!("wait:{w}"));
        let ua_key = pick_best_arm(&UserAgentKey::ALL, &stats, |k| format!("ua:{}", k.as_str()));

        Ok(BrowserConfig {
            name: format!("learned:{domain}"),
            headless_mode,
            wait_strategy,
            user_agent: Some(ua_key.user_agent_string().to_string()),
            stealth_enabled: true,
            ..BrowserConfig::default()
        })
    }

    fn ua_key_for(config: &BrowserConfig) -> UserAgentKey {
        UserAgentKey::ALL
            .into_iter()
            .find(|key| config.user_agent.as_deref() == Some(key.user_agent_string()))
            .unwrap_or(UserAgentKey::ChromeMac)
    }

    /// Upserts the three arms this config touched, then appends a
    /// `request_outcomes` audit row.
    pub async fn record_outcome(&self, domain: &str, config: &BrowserConfig, success: bool, details: &OutcomeDetails) -> LearnerResult<()> {
        let now = Utc::now();
        let arm_keys = [
            format!("headless:{}", config.headless_mode),
            format!("wait:{}", config.wait_strategy),
            format!("ua:{}", Self::ua_key_for(config).as_str()),
        ];

        for arm_key in &arm_keys {
            sqlx::query(
                "INSERT INTO domain_arms (domain, config_key, success_count, failure_count, last_used) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(domain, config_key) DO UPDATE SET \
                   success_count = success_count + excluded.success_count, \
                   failure_count = failure_count + excluded.failure_count, \
                   last_used = excluded.last_used",
            )
            .bind(domain)
            .bind(arm_key)
            .bind(success as i64)
            .bind((!success) as i64)
            .bind(now.to_rfc3339())
            .execute(self.store.pool())
            .await?;
        }

        let tld = domain.rsplit('.').next().unwrap_or(domain);
        sqlx::query(
            "INSERT INTO request_outcomes ( \
                outcome_id, timestamp, domain, url, tld, config_id, user_agent, headless_mode, \
                stealth_enabled, http_status, outcome, blocked_by, content_extracted, content_length, \
                page_title, has_captcha, has_login_wall, response_time_ms \
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(generate_id())
        .bind(now.to_rfc3339())
        .bind(domain)
        .bind(&details.url)
        .bind(tld)
        .bind(&config.config_id)
        .bind(&config.user_agent)
        .bind(config.headless_mode.to_string())
        .bind(config.stealth_enabled as i64)
        .bind(details.http_status.map(i64::from))
        .bind(details.outcome.as_str())
        .bind(details.blocked_by.map(|b| b.as_str()))
        .bind(details.content_extracted as i64)
        .bind(details.content_length as i64)
        .bind(&details.page_title)
        .bind(details.has_captcha as i64)
        .bind(details.has_login_wall as i64)
        .bind(details.response_time_ms as i64)
        .execute(self.store.pool())
        .await?;

        Ok(())
    }

    async fn load_domain_stats(&self, domain: &str) -> LearnerResult<HashMap<String, (u64, u64)>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as("SELECT config_key, success_count, failure_count FROM domain_arms WHERE domain = ?")
            .bind(domain)
            .fetch_all(self.store.pool())
            .await?;

        let mut stats: HashMap<String, (u64, u64)> = rows.into_iter().map(|(k, s, f)| (k, (s as u64, f as u64))).collect();

        if stats.is_empty() {
            for similar in self.find_similar_domains(domain).await? {
                let rows: Vec<(String, i64, i64)> =
                    sqlx::query_as("SELECT config_key, success_count, failure_count FROM domain_arms WHERE domain = ?")
                        .bind(&similar)
                        .fetch_all(self.store.pool())
                        .await?;
                for (key, success, failure) in rows {
                    // Transferred counts are down-weighted to 50%.
                    stats.entry(key).or_insert((success as u64 / 2, failure as u64 / 2));
                }
            }
        }

        Ok(stats)
    }

    async fn find_similar_domains(&self, domain: &str) -> LearnerResult<Vec<String>> {
        let explicit: Vec<(String,)> =
            sqlx::query_as("SELECT domain_b FROM domain_similarity WHERE domain_a = ? ORDER BY similarity_score DESC LIMIT 5")
                .bind(domain)
                .fetch_all(self.store.pool())
                .await?;
        if !explicit.is_empty() {
            return Ok(explicit.into_iter().map(|(d,)| d).collect());
        }

        let parts: Vec<&str> = domain.split('.').collect();
        if parts.len() < 2 {
            return Ok(Vec::new());
        }
        let tld = parts[parts.len() - 1];
        let pattern = format!("%.{tld}");
        let by_tld: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT domain FROM domain_arms WHERE domain LIKE ? AND domain != ? LIMIT 5")
                .bind(&pattern)
                .bind(domain)
                .fetch_all(self.store.pool())
                .await?;
        Ok(by_tld.into_iter().map(|(d,)| d).collect())
    }

    pub async fn get_domain_insights(&self, domain: &str) -> LearnerResult<DomainInsights> {
        let stats = self.load_domain_stats(domain).await?;

        let mut insights = DomainInsights {
            domain: domain.to_string(),
            total_attempts: 0,
            success_rate: 0.0,
            best_headless_mode: None,
            best_wait_strategy: None,
            best_user_agent: None,
            recommendations: Vec::new(),
        };

        if stats.is_empty() {
            insights.recommendations.push("No data for this domain. Will use default configuration.".to_string());
            return Ok(insights);
        }

        let total_success: u64 = stats.values().map(|(s, _)| s).sum();
        let total_failure: u64 = stats.values().map(|(_, f)| f).sum();
        insights.total_attempts = total_success + total_failure;
        insights.success_rate = success_rate(total_success, total_failure);

        insights.best_headless_mode = best_axis_insight(&stats, "headless:");
        insights.best_wait_strategy = best_axis_insight(&stats, "wait:");
        insights.best_user_agent = best_axis_insight(&stats, "ua:");

        if insights.success_rate < 0.5 {
            insights.recommendations.push("Low success rate. Consider using visible browser or adding delays.".to_string());
        }
        if insights.success_rate > 0.9 {
            insights.recommendations.push("High success rate. Current configuration works well.".to_string());
        }

        Ok(insights)
    }

    pub async fn get_global_stats(&self) -> LearnerResult<GlobalStats> {
        let mut stats = GlobalStats::default();

        let (total_domains,): (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT domain) FROM domain_arms").fetch_one(self.store.pool()).await?;
        stats.total_domains = total_domains as u64;

        let (total_success, total_failure): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT SUM(success_count), SUM(failure_count) FROM domain_arms").fetch_one(self.store.pool()).await?;
        let total_success = total_success.unwrap_or(0) as u64;
        let total_failure = total_failure.unwrap_or(0) as u64;
        stats.total_requests = total_success + total_failure;
        if stats.total_requests > 0 {
            stats.overall_success_rate = success_rate(total_success, total_failure);
        }

        let top_configs: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT config_key, SUM(success_count), SUM(failure_count) FROM domain_arms \
             GROUP BY config_key ORDER BY CAST(SUM(success_count) AS REAL) / (SUM(success_count) + SUM(failure_count)) DESC LIMIT 5",
        )
        .fetch_all(self.store.pool())
        .await?;
        for (config_key, success, failure) in top_configs {
            let attempts = (success + failure) as u64;
            if attempts > 0 {
                stats.top_performing_configs.push(ConfigStanding { config_key, success_rate: success_rate(success as u64, failure as u64), attempts });
            }
        }

        let problematic: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT domain, SUM(success_count), SUM(failure_count) FROM domain_arms \
             GROUP BY domain HAVING (SUM(success_count) + SUM(failure_count)) >= 5 \
             ORDER BY CAST(SUM(success_count) AS REAL) / (SUM(success_count) + SUM(failure_count)) ASC LIMIT 10",
        )
        .fetch_all(self.store.pool())
        .await?;
        for (domain, success, failure) in problematic {
            let attempts = (success + failure) as u64;
            let rate = success_rate(success as u64, failure as u64);
            if attempts > 0 && rate < 0.7 {
                stats.problematic_domains.push(DomainStanding { domain, success_rate: rate, attempts });
            }
        }

        Ok(stats)
    }
}

fn best_axis_insight(stats: &HashMap<String, (u64, u64)>, prefix: &str) -> Option<AxisInsight> {
    stats
        .iter()
        .filter(|(k, _)| k.starts_with(prefix))
        .max_by(|a, b| success_rate(a.1 .0, a.1 .1).partial_cmp(&success_rate(b.1 .0, b.1 .1)).unwrap())
        .map(|(key, (success, failure))| AxisInsight {
            key: key[prefix.len()..].to_string(),
            success_rate: success_rate(*success, *failure),
            attempts: success + failure,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_learner() -> DomainLearner {
        let store = Store::open_in_memory().await.unwrap();
        DomainLearner::new(store)
    }

    #[test]
    fn sample_beta_uniform_prior_stays_in_unit_interval() {
        for _ in 0..100 {
            let sample = sample_beta(0, 0);
            assert!((0.0..=1.0).contains(&sample));
        }
    }

    #[tokio::test]
    async fn get_best_config_defaults_with_no_history() {
        let learner = test_learner().await;
        let config = learner.get_best_config("example.com").await.unwrap();
        assert!(config.stealth_enabled);
        assert!(config.user_agent.is_some());
    }

    #[tokio::test]
    async fn record_outcome_updates_arms_and_audit_row() {
        let learner = test_learner().await;
        let config = learner.get_best_config("example.com").await.unwrap();
        let details = OutcomeDetails {
            url: "https://example.com/".to_string(),
            http_status: Some(200),
            outcome: OutcomeType::Success,
            blocked_by: None,
            content_extracted: true,
            content_length: 1024,
            page_title: Some("Example".to_string()),
            has_captcha: false,
            has_login_wall: false,
            response_time_ms: 250,
        };
        learner.record_outcome("example.com", &config, true, &details).await.unwrap();

        let stats = learner.load_domain_stats("example.com").await.unwrap();
        let headless_key = format!("headless:{}", config.headless_mode);
        assert_eq!(stats.get(&headless_key), Some(&(1, 0)));

        let insights = learner.get_domain_insights("example.com").await.unwrap();
        assert_eq!(insights.total_attempts, 1);
        assert_eq!(insights.success_rate, 1.0);
    }

    #[tokio::test]
    async fn cold_start_transfers_half_weight_from_similar_tld() {
        let learner = test_learner().await;
        let config = learner.get_best_config("other.example.com").await.unwrap();
        let details = OutcomeDetails {
            url: "https://other.example.com/".to_string(),
            http_status: Some(200),
            outcome: OutcomeType::Success,
            blocked_by: None,
            content_extracted: true,
            content_length: 10,
            page_title: None,
            has_captcha: false,
            has_login_wall: false,
            response_time_ms: 10,
        };
        // Two successes so integer division by 2 is observable.
        learner.record_outcome("other.example.com", &config, true, &details).await.unwrap();
        learner.record_outcome("other.example.com", &config, true, &details).await.unwrap();

        let stats = learner.load_domain_stats("fresh.example.com").await.unwrap();
        let headless_key = format!("headless:{}", config.headless_mode);
        assert_eq!(stats.get(&headless_key), Some(&(1, 0)), "transferred count should be halved");
    }

    #[tokio::test]
    async fn global_stats_report_zero_with_no_data() {
        let learner = test_learner().await;
        let stats = learner.get_global_stats().await.unwrap();
        assert_eq!(stats.total_domains, 0);
        assert_eq!(stats.total_requests, 0);
    }
}
