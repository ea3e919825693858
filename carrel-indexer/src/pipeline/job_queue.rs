//! Durable, lease-based indexing job queue.
//!
//! Jobs live in the `index_jobs` table next to the documents they index, so
//! enqueueing rides the same transaction as the document mutation that
//! caused it (see [`crate::storage::DocumentIndex`]). A job is claimable
//! when its visibility deadline is unset or in the past; claiming stamps
//! the worker id and pushes the deadline out by the lease duration, all in
//! one UPDATE, so at most one worker holds a job at a time. A dead worker
//! needs no cleanup: once the deadline passes, the job is claimable again
//! with its attempt count intact.
//!
//! The same deadline column doubles as the retry backoff. A retried job is
//! released with `visibility_deadline` set to its next eligible time, which
//! the claim predicate treats identically to an expired lease.
//!
//! Waiting consumers use [`JobQueue::next_job`]: one immediate claim
//! attempt, then a bounded wait on a [`Notify`] nudge (or the claim-wait
//! timeout, whichever comes first), then one more attempt. Producers call
//! [`JobQueue::nudge`] after committing work, so an idle pool picks up new
//! jobs without polling hot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;
use crate::storage::document_index::ts_to_datetime;
use crate::storage::{DocumentId, DocumentIndex};

/// A job claimed by a worker, valid until the lease's visibility deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    pub id: i64,
    pub document_id: DocumentId,
    /// 1-based attempt number for this claim.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

pub(crate) async fn create_job_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS index_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL UNIQUE REFERENCES documents(id) ON DELETE CASCADE,
            attempt INTEGER NOT NULL DEFAULT 1,
            enqueued_at INTEGER NOT NULL,
            lease_owner TEXT,
            visibility_deadline INTEGER
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claimable
         ON index_jobs(visibility_deadline, enqueued_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn decode_job(row: &SqliteRow) -> Result<LeasedJob> {
    let attempt: i64 = row.try_get("attempt")?;
    Ok(LeasedJob {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        attempt: attempt as u32,
        enqueued_at: ts_to_datetime(row.try_get("enqueued_at")?)?,
    })
}

/// Shared handle to the job queue. Clones share the pool and the nudge
/// channel.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
    lease_duration: Duration,
    claim_wait: Duration,
}

impl JobQueue {
    pub fn new(index: &DocumentIndex, lease_duration: Duration, claim_wait: Duration) -> Self {
        Self {
            pool: index.pool().clone(),
            notify: Arc::new(Notify::new()),
            lease_duration,
            claim_wait,
        }
    }

    /// Claim the oldest claimable job for `worker_id`, if any. Stamping the
    /// lease and selecting the job happen in a single UPDATE, so two
    /// workers can never claim the same job.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<LeasedJob>> {
        let now = Utc::now().timestamp();
        let deadline = now + self.lease_duration.as_secs() as i64;
        let row = sqlx::query(
            "UPDATE index_jobs
             SET lease_owner = ?, visibility_deadline = ?
             WHERE id = (
                 SELECT id FROM index_jobs
                 WHERE visibility_deadline IS NULL OR visibility_deadline <= ?
                 ORDER BY enqueued_at, id
                 LIMIT 1
             )
             RETURNING id, document_id, attempt, enqueued_at",
        )
        .bind(worker_id)
        .bind(deadline)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        let job = row.map(|r| decode_job(&r)).transpose()?;
        if let Some(job) = &job {
            debug!(
                job_id = job.id,
                document_id = job.document_id,
                attempt = job.attempt,
                worker_id,
                "job claimed"
            );
        }
        Ok(job)
    }

    /// Claim the next job, waiting up to the claim-wait interval for a
    /// nudge if the queue is momentarily empty. Returns `None` when
    /// nothing became claimable in time, so callers can re-check shutdown
    /// between waits.
    pub async fn next_job(&self, worker_id: &str) -> Result<Option<LeasedJob>> {
        if let Some(job) = self.claim(worker_id).await? {
            return Ok(Some(job));
        }
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.claim_wait) => {}
        }
        self.claim(worker_id).await
    }

    /// Wake one waiting consumer. Called after any commit that may have
    /// made a job claimable.
    pub fn nudge(&self) {
        self.notify.notify_one();
    }

    /// Drop a claimed job whose document no longer needs it (deleted or
    /// already terminal). Lease-guarded; a lost lease makes this a no-op.
    pub async fn discard(&self, job: &LeasedJob, worker_id: &str) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM index_jobs WHERE id = ? AND lease_owner = ?")
            .bind(job.id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(job_id = job.id, document_id = job.document_id, deleted, "job discarded");
        Ok(())
    }

    /// Total queued jobs, leased or not.
    pub async fn depth(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
