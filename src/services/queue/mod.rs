//! Priority job queue: atomic lease-based claim, dependency gating,
//! exponential-backoff retry, and a dead-letter tier.
//!
//! Grounded on `original_source/services/queue/service.py` (`JobQueue`),
//! adapted from asyncio tasks + aiosqlite to tokio tasks over the shared
//! `Store`'s `sqlx::SqlitePool`. The claim algorithm keeps the original's
//! three steps (lease sweeper, priority-ordered dependency-gated select,
//! conditional update) inside one transaction so concurrent workers never
//! double-claim a row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::database::{Store, StoreError};
use crate::core::models::{DeadLetterEntry, Job, JobStatus, JobType};

/// How long a claimed job may stay RUNNING before the lease sweeper
/// reclaims it back to PENDING. Tied to the behaviors engine's total
/// deadline; not configurable in the original.
const LEASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("timestamp parse error: {0}")]
    Chrono(#[from] chrono::ParseError),
    #[error("unrecognized job_type {0:?}")]
    UnknownJobType(String),
    #[error("unrecognized status {0:?}")]
    UnknownStatus(String),
}

pub type QueueResult<T> = Result<T, JobQueueError>;

/// Error a registered handler reports back to the queue.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct JobError(pub String);

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError(e.to_string())
    }
}

impl From<&str> for JobError {
    fn from(s: &str) -> Self {
        JobError(s.to_string())
    }
}

/// A boxed async handler for one `JobType`. Built once via `register_handler`
/// before `start()` and never mutated afterward — a plain field on
/// `JobQueue`, not module-level state.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<serde_json::Value, JobError>> + Send + Sync>;

/// Request to enqueue, for `enqueue_batch`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    job_type: String,
    priority: i64,
    status: String,
    payload: Option<String>,
    depends_on: Option<String>,
    retry_count: i64,
    error: Option<String>,
    result: Option<String>,
    scheduled_for: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn parse_dt(s: &str) -> QueueResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_dt_opt(s: Option<&str>) -> QueueResult<Option<DateTime<Utc>>> {
    s.map(parse_dt).transpose()
}

impl JobRow {
    fn into_job(self) -> QueueResult<Job> {
        Ok(Job {
            job_id: self.job_id,
            job_type: JobType::from_str_opt(&self.job_type)
                .ok_or_else(|| JobQueueError::UnknownJobType(self.job_type.clone()))?,
            payload: self.payload.as_deref().map(serde_json::from_str).transpose()?.unwrap_or(serde_json::Value::Null),
            status: JobStatus::from_str_opt(&self.status)
                .ok_or_else(|| JobQueueError::UnknownStatus(self.status.clone()))?,
            priority: self.priority,
            retry_count: self.retry_count as u32,
            depends_on: self.depends_on,
            scheduled_for: parse_dt(&self.scheduled_for)?,
            created_at: parse_dt(&self.created_at)?,
            started_at: parse_dt_opt(self.started_at.as_deref())?,
            completed_at: parse_dt_opt(self.completed_at.as_deref())?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: i64,
    job_id: String,
    job_type: String,
    payload: Option<String>,
    error: String,
    retry_count: i64,
    original_created_at: String,
    failed_at: String,
}

impl DeadLetterRow {
    fn into_entry(self) -> QueueResult<DeadLetterEntry> {
        Ok(DeadLetterEntry {
            id: self.id,
            job_id: self.job_id,
            job_type: JobType::from_str_opt(&self.job_type)
                .ok_or_else(|| JobQueueError::UnknownJobType(self.job_type.clone()))?,
            payload: self.payload.as_deref().map(serde_json::from_str).transpose()?.unwrap_or(serde_json::Value::Null),
            error: self.error,
            retry_count: self.retry_count as u32,
            original_created_at: parse_dt(&self.original_created_at)?,
            failed_at: parse_dt(&self.failed_at)?,
        })
    }
}

pub struct JobQueue {
    store: Store,
    handlers: RwLock<HashMap<JobType, JobHandler>>,
    max_retries: u32,
    base_retry_delay_ms: i64,
    max_concurrent: usize,
    shutdown: Arc<AtomicBool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(store: Store, max_retries: u32, base_retry_delay_ms: i64, max_concurrent: usize) -> Self {
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
            max_retries,
            base_retry_delay_ms,
            max_concurrent,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn register_handler(&self, job_type: JobType, handler: JobHandler) {
        self.handlers.write().insert(job_type, handler);
    }

    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: i64,
        depends_on: Option<String>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> QueueResult<String> {
        let mut job = Job::new(job_type, payload, priority);
        job.depends_on = depends_on;
        if let Some(when) = scheduled_for {
            job.scheduled_for = when;
        }
        self.insert_job(&job, self.store.pool()).await?;
        Ok(job.job_id)
    }

    /// All-or-nothing: every job is inserted inside one transaction.
    pub async fn enqueue_batch(&self, jobs: Vec<NewJob>, priority: i64) -> QueueResult<Vec<String>> {
        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;
        let mut ids = Vec::with_capacity(jobs.len());
        for new_job in jobs {
            let mut job = Job::new(new_job.job_type, new_job.payload, priority);
            job.scheduled_for = now;
            self.insert_job_tx(&job, &mut tx).await?;
            ids.push(job.job_id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn insert_job(&self, job: &Job, pool: &sqlx::SqlitePool) -> QueueResult<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, job_type, priority, status, payload, depends_on, retry_count, scheduled_for, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(&job.depends_on)
        .bind(job.retry_count as i64)
        .bind(job.scheduled_for.to_rfc3339())
        .bind(job.created_at.to_rfc3339())
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn insert_job_tx(&self, job: &Job, tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> QueueResult<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, job_type, priority, status, payload, depends_on, retry_count, scheduled_for, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(&job.depends_on)
        .bind(job.retry_count as i64)
        .bind(job.scheduled_for.to_rfc3339())
        .bind(job.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> QueueResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Succeeds only if the job is currently PENDING.
    pub async fn cancel(&self, job_id: &str) -> QueueResult<bool> {
        let result = sqlx::query("UPDATE jobs SET status = ? WHERE job_id = ? AND status = ?")
            .bind(JobStatus::Cancelled.as_str())
            .bind(job_id)
            .bind(JobStatus::Pending.as_str())
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn queue_stats(&self) -> QueueResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn dead_letter_list(&self, limit: i64, offset: i64) -> QueueResult<Vec<DeadLetterEntry>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as("SELECT * FROM job_dead_letter ORDER BY failed_at DESC LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(self.store.pool())
            .await?;
        rows.into_iter().map(DeadLetterRow::into_entry).collect()
    }

    pub async fn retry_dead_letter(&self, job_id: &str) -> QueueResult<Option<String>> {
        let row: Option<DeadLetterRow> = sqlx::query_as("SELECT * FROM job_dead_letter WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.store.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };

        let job_type = JobType::from_str_opt(&row.job_type)
            .ok_or_else(|| JobQueueError::UnknownJobType(row.job_type.clone()))?;
        let payload = row.payload.as_deref().map(serde_json::from_str).transpose()?.unwrap_or(serde_json::Value::Null);

        let new_id = self.enqueue(job_type, payload, 0, None, None).await?;
        sqlx::query("DELETE FROM job_dead_letter WHERE job_id = ?")
            .bind(job_id)
            .execute(self.store.pool())
            .await?;
        Ok(Some(new_id))
    }

    /// Claim algorithm: lease sweep, dependency-gated priority select, then
    /// a conditional update — all inside one transaction so a lost race
    /// (rows_affected == 0) just returns `None` rather than an error.
    async fn claim_next_job(&self) -> QueueResult<Option<Job>> {
        let mut tx = self.store.pool().begin().await?;
        let now = Utc::now();
        let lease_cutoff = (now - chrono::Duration::from_std(LEASE_TIMEOUT).unwrap()).to_rfc3339();

        sqlx::query("UPDATE jobs SET status = ?, started_at = NULL WHERE status = ? AND started_at < ?")
            .bind(JobStatus::Pending.as_str())
            .bind(JobStatus::Running.as_str())
            .bind(&lease_cutoff)
            .execute(&mut *tx)
            .await?;

        let now_str = now.to_rfc3339();
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT j.* FROM jobs j WHERE j.status = ? AND j.scheduled_for <= ? \
             AND (j.depends_on IS NULL OR EXISTS (SELECT 1 FROM jobs d WHERE d.job_id = j.depends_on AND d.status = ?)) \
             ORDER BY j.priority DESC, j.scheduled_for ASC LIMIT 1",
        )
        .bind(JobStatus::Pending.as_str())
        .bind(&now_str)
        .bind(JobStatus::Completed.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let result = sqlx::query("UPDATE jobs SET status = ?, started_at = ? WHERE job_id = ? AND status = ?")
            .bind(JobStatus::Running.as_str())
            .bind(&now_str)
            .bind(&row.job_id)
            .bind(JobStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }
        tx.commit().await?;

        let mut job = row.into_job()?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Ok(Some(job))
    }

    async fn complete_job(&self, job_id: &str, value: serde_json::Value) -> QueueResult<()> {
        sqlx::query("UPDATE jobs SET status = ?, result = ?, completed_at = ? WHERE job_id = ?")
            .bind(JobStatus::Completed.as_str())
            .bind(serde_json::to_string(&value)?)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, error: &str) -> QueueResult<()> {
        sqlx::query("UPDATE jobs SET status = ?, error = ?, completed_at = ? WHERE job_id = ?")
            .bind(JobStatus::Failed.as_str())
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    async fn move_to_dead_letter(&self, job: &Job, error: &str) -> QueueResult<()> {
        sqlx::query(
            "INSERT INTO job_dead_letter (job_id, job_type, payload, error, retry_count, original_created_at, failed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(job.job_type.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(error)
        .bind(job.retry_count as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    async fn handle_job_failure(&self, job: &mut Job, error: &str) -> QueueResult<()> {
        job.retry_count += 1;
        if job.retry_count >= self.max_retries {
            self.fail_job(&job.job_id, error).await?;
            self.move_to_dead_letter(job, error).await?;
            return Ok(());
        }

        let delay_ms = self.base_retry_delay_ms * 2i64.pow(job.retry_count - 1);
        let scheduled_for = Utc::now() + chrono::Duration::milliseconds(delay_ms);
        sqlx::query("UPDATE jobs SET status = ?, retry_count = ?, scheduled_for = ?, started_at = NULL, error = ? WHERE job_id = ?")
            .bind(JobStatus::Pending.as_str())
            .bind(job.retry_count as i64)
            .bind(scheduled_for.to_rfc3339())
            .bind(error)
            .bind(&job.job_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    async fn process_job(&self, mut job: Job) {
        let handler = self.handlers.read().get(&job.job_type).cloned();
        let Some(handler) = handler else {
            if let Err(e) = self.fail_job(&job.job_id, "no handler").await {
                error!("failed to mark job {} failed: {e}", job.job_id);
            }
            return;
        };

        match handler(job.clone()).await {
            Ok(value) => {
                if let Err(e) = self.complete_job(&job.job_id, value).await {
                    error!("failed to mark job {} completed: {e}", job.job_id);
                }
            }
            Err(e) => {
                if let Err(store_err) = self.handle_job_failure(&mut job, &e.0).await {
                    error!("failed to record failure for job {}: {store_err}", job.job_id);
                }
            }
        }
    }

    /// Spawns `num_workers` (default `max_concurrent`) cooperative worker
    /// loops: claim → dispatch → complete/fail, sleeping 500 ms when the
    /// queue is empty and backing off 1 s after an unexpected claim error.
    pub fn start(self: &Arc<Self>, num_workers: Option<usize>) {
        self.shutdown.store(false, Ordering::SeqCst);
        let count = num_workers.unwrap_or(self.max_concurrent);
        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..count {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move { queue.worker_loop(worker_id).await }));
        }
        info!("job queue started with {count} workers");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.claim_next_job().await {
                Ok(Some(job)) => {
                    debug!("worker {worker_id} claimed job {}", job.job_id);
                    self.process_job(job).await;
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(500)).await,
                Err(e) => {
                    warn!("worker {worker_id} claim error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// `wait=true` signals workers to stop after their current iteration and
    /// awaits them; `wait=false` aborts the tasks immediately, leaving any
    /// in-flight job RUNNING in the store for the lease sweeper to reclaim.
    pub async fn stop(&self, wait: bool) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.workers.lock().unwrap());
        if wait {
            for handle in handles {
                let _ = handle.await;
            }
        } else {
            for handle in handles {
                handle.abort();
            }
        }
        info!("job queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_queue() -> JobQueue {
        let store = Store::open_in_memory().await.unwrap();
        JobQueue::new(store, 3, 10, 2)
    }

    #[tokio::test]
    async fn enqueue_and_get_roundtrip() {
        let queue = test_queue().await;
        let id = queue.enqueue(JobType::Capture, json!({"url": "https://example.com"}), 5, None, None).await.unwrap();
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 5);
        assert_eq!(job.payload["url"], "https://example.com");
    }

    #[tokio::test]
    async fn claim_respects_priority_order() {
        let queue = test_queue().await;
        queue.enqueue(JobType::Capture, json!({}), 1, None, None).await.unwrap();
        let high_id = queue.enqueue(JobType::Capture, json!({}), 10, None, None).await.unwrap();

        let claimed = queue.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, high_id);
    }

    #[tokio::test]
    async fn claim_skips_unsatisfied_dependency() {
        let queue = test_queue().await;
        let dep_id = queue.enqueue(JobType::Capture, json!({}), 0, None, None).await.unwrap();
        queue.enqueue(JobType::Capture, json!({}), 0, Some(dep_id.clone()), None).await.unwrap();

        let claimed = queue.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, dep_id, "only the dependency-free job should be claimable");
    }

    #[tokio::test]
    async fn claim_is_atomic_single_winner() {
        let queue = Arc::new(test_queue().await);
        queue.enqueue(JobType::Capture, json!({}), 0, None, None).await.unwrap();

        let a = queue.claim_next_job().await.unwrap();
        let b = queue.claim_next_job().await.unwrap();
        assert!(a.is_some());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn cancel_only_affects_pending() {
        let queue = test_queue().await;
        let id = queue.enqueue(JobType::Capture, json!({}), 0, None, None).await.unwrap();
        assert!(queue.cancel(&id).await.unwrap());
        assert!(!queue.cancel(&id).await.unwrap(), "already-cancelled job should not cancel again");
    }

    #[tokio::test]
    async fn failure_retries_then_dead_letters() {
        let queue = test_queue().await;
        let id = queue.enqueue(JobType::Capture, json!({}), 0, None, None).await.unwrap();
        let mut job = queue.get(&id).await.unwrap().unwrap();

        queue.handle_job_failure(&mut job, "boom").await.unwrap();
        let reloaded = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Pending);
        assert_eq!(reloaded.retry_count, 1);

        let mut job = reloaded;
        queue.handle_job_failure(&mut job, "boom").await.unwrap();
        let mut job = queue.get(&id).await.unwrap().unwrap();
        queue.handle_job_failure(&mut job, "boom").await.unwrap();

        let final_job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(final_job.status, JobStatus::Failed);
        assert_eq!(final_job.retry_count, 3);

        let dead_letter = queue.dead_letter_list(10, 0).await.unwrap();
        assert_eq!(dead_letter.len(), 1);
        assert_eq!(dead_letter[0].error, "boom");
    }

    #[tokio::test]
    async fn retry_dead_letter_reenqueues_and_clears_row() {
        let queue = test_queue().await;
        let id = queue.enqueue(JobType::Capture, json!({"a": 1}), 0, None, None).await.unwrap();
        let mut job = queue.get(&id).await.unwrap().unwrap();
        for _ in 0..3 {
            queue.handle_job_failure(&mut job, "boom").await.unwrap();
            job = queue.get(&id).await.unwrap().unwrap();
        }

        let new_id = queue.retry_dead_letter(&id).await.unwrap().expect("should re-enqueue");
        assert_ne!(new_id, id);
        assert!(queue.dead_letter_list(10, 0).await.unwrap().is_empty());
        let new_job = queue.get(&new_id).await.unwrap().unwrap();
        assert_eq!(new_job.payload["a"], 1);
    }

    #[tokio::test]
    async fn missing_handler_fails_job_without_retry() {
        let queue = test_queue().await;
        let id = queue.enqueue(JobType::Capture, json!({}), 0, None, None).await.unwrap();
        let job = queue.get(&id).await.unwrap().unwrap();
        queue.process_job(job).await;

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("no handler"));
    }

    #[tokio::test]
    async fn registered_handler_completes_job() {
        let queue = test_queue().await;
        queue.register_handler(
            JobType::Capture,
            Arc::new(|job: Job| Box::pin(async move { Ok(json!({"echo": job.payload})) })),
        );
        let id = queue.enqueue(JobType::Capture, json!({"url": "x"}), 0, None, None).await.unwrap();
        let job = queue.get(&id).await.unwrap().unwrap();
        queue.process_job(job).await;

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["echo"]["url"], "x");
    }

    #[tokio::test]
    async fn enqueue_batch_is_all_or_nothing() {
        let queue = test_queue().await;
        let ids = queue
            .enqueue_batch(
                vec![
                    NewJob { job_type: JobType::Capture, payload: json!({}) },
                    NewJob { job_type: JobType::Scrape, payload: json!({}) },
                ],
                0,
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.get("pending"), Some(&2));
    }
}
