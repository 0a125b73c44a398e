//! Durable job queue on top of the shared SQLite pool.
//!
//! A message is `queued` until a worker leases it. A lease carries a random
//! token and an expiry; only the holder of the current token can settle the
//! message. Settling either deletes it (ack), schedules a redelivery with
//! backoff, or parks it as `dead`. A lease that expires without being settled
//! makes the message deliverable again while it still has attempts left.

mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid message payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A leased message.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Optional key of the entity the message is about (the task id).
    pub reference: Option<String>,
    pub payload: String,
    /// Deliveries so far, including this one.
    pub attempts: u32,
    pub max_retries: u32,
    pub lease_token: String,
    pub lease_expires_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// No redelivery follows a failure of this attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts > self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Requeued, deliverable again after `delay`.
    Retry { delay: Duration },
    Dead,
    /// The lease was no longer ours; nothing changed.
    Stale,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub queued: u64,
    pub leased: u64,
    pub dead: u64,
}

const JOB_COLUMNS: &str = "id, queue, reference, payload, attempts, max_retries, \
     lease_token, lease_expires_at, last_error, created_at";

pub struct JobQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
    lease_duration: Duration,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub async fn new(
        pool: SqlitePool,
        policy: RetryPolicy,
        lease_duration: Duration,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            pool,
            policy,
            lease_duration,
            notify: Arc::new(Notify::new()),
        };
        queue.init_schema().await?;
        info!(
            "Job queue ready: max_retries={}, backoff={:?}..{:?}, lease={:?}",
            policy.max_retries, policy.min_backoff, policy.max_backoff, lease_duration
        );
        Ok(queue)
    }

    async fn init_schema(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                reference TEXT,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                lease_token TEXT,
                lease_expires_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_delivery ON jobs (queue, status, available_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_reference ON jobs (queue, reference)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist a message. Once this returns the message survives restarts.
    pub async fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        reference: Option<&str>,
        payload: &T,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(payload)?;
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, reference, payload, status, attempts, max_retries,
                              available_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?6, ?6)
            "#,
        )
        .bind(&id)
        .bind(queue)
        .bind(reference)
        .bind(&payload)
        .bind(self.policy.max_retries as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!("Enqueued job {} on {}", id, queue);
        self.notify.notify_one();
        Ok(id)
    }

    /// Atomically take the next deliverable message, if any.
    ///
    /// Deliverable means queued and due, or leased with an expired lease and
    /// attempts left.
    pub async fn lease(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let now = now_millis();
        let expires = now + self.lease_duration.as_millis() as i64;
        let token = Uuid::new_v4().to_string();

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'leased', attempts = attempts + 1, lease_token = ?1,
                lease_expires_at = ?2, updated_at = ?3
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?4
                  AND ((status = 'queued' AND available_at <= ?3)
                       OR (status = 'leased' AND lease_expires_at <= ?3 AND attempts <= max_retries))
                ORDER BY available_at, created_at
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(&token)
            .bind(expires)
            .bind(now)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await?;

        let job = row.map(|r| row_to_job(&r)).transpose()?;
        if let Some(job) = &job {
            if job.attempts > 1 {
                info!(
                    "Redelivering job {} (attempt {}/{})",
                    job.id,
                    job.attempts,
                    job.max_retries + 1
                );
            }
        }
        Ok(job)
    }

    /// Remove a successfully handled message. Returns false when the lease was lost.
    pub async fn ack(&self, job: &Job) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1 AND lease_token = ?2")
            .bind(&job.id)
            .bind(&job.lease_token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!("Ack for job {} ignored, lease no longer held", job.id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Report a failed delivery.
    ///
    /// Retryable failures are requeued with backoff until the attempts run
    /// out; anything else goes straight to the dead state.
    pub async fn nack(
        &self,
        job: &Job,
        error: &str,
        retryable: bool,
    ) -> Result<NackOutcome, QueueError> {
        let now = now_millis();

        if !retryable || job.is_final_attempt() {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'dead', last_error = ?1, lease_token = NULL,
                    lease_expires_at = NULL, updated_at = ?2
                WHERE id = ?3 AND lease_token = ?4
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(&job.id)
            .bind(&job.lease_token)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(NackOutcome::Stale);
            }
            return Ok(NackOutcome::Dead);
        }

        let delay = self.policy.backoff(job.attempts);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', available_at = ?1, last_error = ?2, lease_token = NULL,
                lease_expires_at = NULL, updated_at = ?3
            WHERE id = ?4 AND lease_token = ?5
            "#,
        )
        .bind(now + delay.as_millis() as i64)
        .bind(error)
        .bind(now)
        .bind(&job.id)
        .bind(&job.lease_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(NackOutcome::Stale);
        }
        Ok(NackOutcome::Retry { delay })
    }

    /// Dead-letter leases that expired on their last attempt and return them.
    pub async fn reap_expired(&self, queue: &str) -> Result<Vec<Job>, QueueError> {
        let now = now_millis();
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'dead', last_error = 'lease expired', lease_token = NULL,
                updated_at = ?1
            WHERE queue = ?2 AND status = 'leased' AND lease_expires_at <= ?1
              AND attempts > max_retries
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(queue)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Drop queued messages about `reference`. Leased ones are left to their worker.
    pub async fn cancel(&self, queue: &str, reference: &str) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE queue = ?1 AND reference = ?2 AND status = 'queued'",
        )
        .bind(queue)
        .bind(reference)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Payloads of messages that may still be delivered.
    pub async fn live_payloads(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        let rows = sqlx::query(
            "SELECT payload FROM jobs WHERE queue = ?1 AND status IN ('queued', 'leased')",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("payload")).collect())
    }

    pub async fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM jobs WHERE queue = ?1 GROUP BY status",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let status: String = row.get("status");
            let count = row.get::<i64, _>("count").max(0) as u64;
            match status.as_str() {
                "queued" => depth.queued = count,
                "leased" => depth.leased = count,
                "dead" => depth.dead = count,
                other => warn!("Unknown job status in queue {}: {}", queue, other),
            }
        }
        Ok(depth)
    }

    /// Wait until something is enqueued or `timeout` passes.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_job(row: &SqliteRow) -> Result<Job, QueueError> {
    Ok(Job {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        reference: row.try_get("reference")?,
        payload: row.try_get("payload")?,
        attempts: row.try_get::<i64, _>("attempts")?.max(0) as u32,
        max_retries: row.try_get::<i64, _>("max_retries")?.max(0) as u32,
        lease_token: row
            .try_get::<Option<String>, _>("lease_token")?
            .unwrap_or_default(),
        lease_expires_at: from_millis(
            row.try_get::<Option<i64>, _>("lease_expires_at")?
                .unwrap_or_default(),
        ),
        last_error: row.try_get("last_error")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}
