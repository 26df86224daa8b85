//! # JobQueue
//!
//! A durable, priority-ordered job queue backed by a single PostgreSQL
//! table. Claims use `SELECT ... FOR UPDATE SKIP LOCKED` so workers never
//! block each other and never double-claim a row.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by `JobQueue` operations (spec §7).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
    #[error("payload is empty or not valid JSON")]
    InvalidPayload,
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Closed set of job lifecycle states (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, serde::Deserialize)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(QueueError::ParseJobStatusError(other.to_owned())),
        }
    }
}

/// Closed set of job types the worker pool knows how to dispatch (spec §4.5,
/// §9 "Closed polymorphic job dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, serde::Deserialize)]
#[sqlx(type_name = "job_type")]
#[sqlx(rename_all = "snake_case")]
pub enum JobType {
    BankingInfoFetch,
    RiskEvaluation,
    DocumentValidation,
    Notification,
    WebhookCall,
    AuditLog,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobType::BankingInfoFetch => "banking_info_fetch",
            JobType::RiskEvaluation => "risk_evaluation",
            JobType::DocumentValidation => "document_validation",
            JobType::Notification => "notification",
            JobType::WebhookCall => "webhook_call",
            JobType::AuditLog => "audit_log",
        };
        write!(f, "{s}")
    }
}

/// A unit of asynchronous work (spec §3).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, serde::Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub r#type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Deserialize this job's payload into a concrete handler-specific type.
    pub fn parameters<P: DeserializeOwned>(&self) -> QueueResult<P> {
        serde_json::from_value(self.payload.clone()).map_err(|_| QueueError::InvalidPayload)
    }
}

/// A job to be enqueued. `id` is assigned by the queue if left empty.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Option<Uuid>,
    pub r#type: JobType,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(job_type: JobType, priority: i32, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            r#type: job_type,
            priority,
            payload,
            max_attempts: 3,
        }
    }
}

/// Quadratic backoff window applied on `Fail` when attempts remain:
/// `delay = attempts² · 30s` (spec §4.2).
fn backoff_delay(attempts: i32) -> Duration {
    Duration::seconds((attempts as i64).pow(2) * 30)
}

/// A durable priority queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    table: String,
}

impl JobQueue {
    pub async fn new(url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self {
            pool,
            table: "jobs_queue".to_owned(),
        })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            table: "jobs_queue".to_owned(),
        }
    }

    /// Enqueue a job for immediate eligibility (spec §4.2 Enqueue).
    pub async fn enqueue(&self, mut job: NewJob) -> QueueResult<Uuid> {
        self.validate_payload(&job.payload)?;
        if job.max_attempts == 0 {
            job.max_attempts = 3;
        }
        let id = job.id.unwrap_or_else(Uuid::new_v4);

        let query = format!(
            r#"
INSERT INTO "{0}"
    (id, type, status, priority, payload, attempts, max_attempts, scheduled_at, created_at, updated_at)
VALUES
    ($1, $2, 'pending'::job_status, $3, $4, 0, $5, NOW(), NOW(), NOW())
            "#,
            self.table
        );

        sqlx::query(&query)
            .bind(id)
            .bind(job.r#type)
            .bind(job.priority)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(id)
    }

    /// Enqueue a job not eligible until `delay` from now (spec §4.2 EnqueueWithDelay).
    pub async fn enqueue_with_delay(
        &self,
        mut job: NewJob,
        delay: std::time::Duration,
    ) -> QueueResult<Uuid> {
        self.validate_payload(&job.payload)?;
        if job.max_attempts == 0 {
            job.max_attempts = 3;
        }
        let id = job.id.unwrap_or_else(Uuid::new_v4);
        let delay = Duration::from_std(delay).unwrap_or(Duration::zero());

        let query = format!(
            r#"
INSERT INTO "{0}"
    (id, type, status, priority, payload, attempts, max_attempts, scheduled_at, created_at, updated_at)
VALUES
    ($1, $2, 'pending'::job_status, $3, $4, 0, $5, NOW() + $6, NOW(), NOW())
            "#,
            self.table
        );

        sqlx::query(&query)
            .bind(id)
            .bind(job.r#type)
            .bind(job.priority)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .bind(delay)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(id)
    }

    fn validate_payload(&self, payload: &serde_json::Value) -> QueueResult<()> {
        if payload.is_null() {
            return Err(QueueError::InvalidPayload);
        }
        Ok(())
    }

    /// Atomically claim the single highest-priority, oldest-eligible job
    /// (spec §4.2 Dequeue). Never blocks; never returns a row another
    /// worker holds a lease on.
    pub async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let query = format!(
            r#"
WITH next_job AS (
    SELECT id
    FROM "{0}"
    WHERE status IN ('pending', 'retrying')
        AND scheduled_at <= NOW()
    ORDER BY priority DESC, scheduled_at ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE "{0}"
SET
    status = 'processing'::job_status,
    started_at = NOW(),
    worker_id = $1,
    attempts = "{0}".attempts + 1,
    updated_at = NOW()
FROM next_job
WHERE "{0}".id = next_job.id
RETURNING "{0}".*
            "#,
            self.table
        );

        let job: Option<Job> = sqlx::query_as(&query)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(job)
    }

    /// Settle a job as completed (spec §4.2 Complete).
    pub async fn complete(&self, job_id: Uuid, result: Option<serde_json::Value>) -> QueueResult<()> {
        let query = format!(
            r#"
UPDATE "{0}"
SET status = 'completed'::job_status, result = $2, completed_at = NOW(), updated_at = NOW()
WHERE id = $1
            "#,
            self.table
        );

        sqlx::query(&query)
            .bind(job_id)
            .bind(result)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Settle a job as either retryable or permanently failed, depending on
    /// remaining attempts (spec §4.2 Fail).
    pub async fn fail(&self, job_id: Uuid, error_message: &str) -> QueueResult<()> {
        let row: (i32, i32) = sqlx::query_as(&format!(
            r#"SELECT attempts, max_attempts FROM "{0}" WHERE id = $1"#,
            self.table
        ))
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        let (attempts, max_attempts) = row;

        if attempts < max_attempts {
            let delay = backoff_delay(attempts);
            let query = format!(
                r#"
UPDATE "{0}"
SET status = 'retrying'::job_status, scheduled_at = NOW() + $2, error_message = $3, updated_at = NOW()
WHERE id = $1
                "#,
                self.table
            );

            sqlx::query(&query)
                .bind(job_id)
                .bind(delay)
                .bind(error_message)
                .execute(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        } else {
            let query = format!(
                r#"
UPDATE "{0}"
SET status = 'failed'::job_status, error_message = $2, completed_at = NOW(), updated_at = NOW()
WHERE id = $1
                "#,
                self.table
            );

            sqlx::query(&query)
                .bind(job_id)
                .bind(error_message)
                .execute(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }

        Ok(())
    }

    /// Count jobs grouped by status (spec §4.2 Stats).
    pub async fn stats(&self) -> QueueResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            r#"SELECT status::text, COUNT(*) FROM "{0}" GROUP BY status"#,
            self.table
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(rows.into_iter().collect())
    }

    /// Reclaim jobs whose lease-holder disappeared before settling (spec
    /// §4.2 RecoverOrphans). Returns the number of rows recovered.
    pub async fn recover_orphans(&self, stale_minutes: i64) -> QueueResult<u64> {
        let query = format!(
            r#"
UPDATE "{0}"
SET status = 'pending'::job_status, worker_id = NULL, started_at = NULL, updated_at = NOW()
WHERE status = 'processing'
    AND started_at < NOW() - ($1 || ' minutes')::interval
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(stale_minutes)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_quadratic_formula() {
        assert_eq!(backoff_delay(1), Duration::seconds(30));
        assert_eq!(backoff_delay(2), Duration::seconds(120));
        assert_eq!(backoff_delay(3), Duration::seconds(270));
    }

    #[test]
    fn job_status_round_trips() {
        for (s, status) in [
            ("pending", JobStatus::Pending),
            ("processing", JobStatus::Processing),
            ("completed", JobStatus::Completed),
            ("failed", JobStatus::Failed),
            ("retrying", JobStatus::Retrying),
            ("cancelled", JobStatus::Cancelled),
        ] {
            assert_eq!(JobStatus::from_str(s).unwrap(), status);
        }
        assert!(JobStatus::from_str("bogus").is_err());
    }

    #[test]
    fn job_type_display_matches_snake_case_envelope_names() {
        assert_eq!(JobType::BankingInfoFetch.to_string(), "banking_info_fetch");
        assert_eq!(JobType::RiskEvaluation.to_string(), "risk_evaluation");
        assert_eq!(JobType::DocumentValidation.to_string(), "document_validation");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn enqueue_then_dequeue_round_trips_the_payload(pool: PgPool) {
        let queue = JobQueue::new_from_pool(pool);
        let job_id = queue
            .enqueue(NewJob::new(JobType::AuditLog, 0, serde_json::json!({"foo": "bar"})))
            .await
            .expect("enqueue failed");

        let job = queue
            .dequeue("worker-1")
            .await
            .expect("dequeue failed")
            .expect("expected a job");

        assert_eq!(job.id, job_id);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.payload, serde_json::json!({"foo": "bar"}));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn dequeue_orders_by_priority_then_age(pool: PgPool) {
        let queue = JobQueue::new_from_pool(pool);
        let low = queue
            .enqueue(NewJob::new(JobType::AuditLog, 1, serde_json::json!({})))
            .await
            .unwrap();
        let high = queue
            .enqueue(NewJob::new(JobType::AuditLog, 5, serde_json::json!({})))
            .await
            .unwrap();

        let first = queue.dequeue("worker-1").await.unwrap().unwrap();
        assert_eq!(first.id, high);
        let second = queue.dequeue("worker-1").await.unwrap().unwrap();
        assert_eq!(second.id, low);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn fail_with_remaining_attempts_schedules_a_retry(pool: PgPool) {
        let queue = JobQueue::new_from_pool(pool);
        let mut job = NewJob::new(JobType::AuditLog, 0, serde_json::json!({}));
        job.max_attempts = 3;
        queue.enqueue(job).await.unwrap();

        let claimed = queue.dequeue("worker-1").await.unwrap().unwrap();
        queue.fail(claimed.id, "boom").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.get("retrying").copied(), Some(1));
        assert!(stats.get("failed").is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn fail_on_last_attempt_is_terminal(pool: PgPool) {
        let queue = JobQueue::new_from_pool(pool);
        let mut job = NewJob::new(JobType::AuditLog, 0, serde_json::json!({}));
        job.max_attempts = 1;
        queue.enqueue(job).await.unwrap();

        let claimed = queue.dequeue("worker-1").await.unwrap().unwrap();
        queue.fail(claimed.id, "boom").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.get("failed").copied(), Some(1));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn recover_orphans_reclaims_stale_processing_jobs(pool: PgPool) {
        let queue = JobQueue::new_from_pool(pool.clone());
        queue
            .enqueue(NewJob::new(JobType::AuditLog, 0, serde_json::json!({})))
            .await
            .unwrap();
        queue.dequeue("worker-1").await.unwrap().unwrap();

        sqlx::query(r#"UPDATE jobs_queue SET started_at = NOW() - INTERVAL '1 hour'"#)
            .execute(&pool)
            .await
            .unwrap();

        let recovered = queue.recover_orphans(30).await.unwrap();
        assert_eq!(recovered, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.get("pending").copied(), Some(1));
    }
}
