// Durable job queue over so_jobs / so_progress
// Claims are atomic conditional updates; progress lives in its own table so
// frequent writes do not contend with job-row transitions

use crate::constants::jobs::{AWAIT_POLL_MS, BACKOFF_BASE_SECONDS, BACKOFF_MAX_SECONDS};
use crate::error::{CoreError, Result};
use crate::job::{deterministic_job_id, Job, JobKind, JobState, NewJob};
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still waiting and is now cancelled
    Cancelled,
    /// The job is running; its handler has been signalled
    Signalled,
    /// The job had already reached a terminal state
    AlreadyTerminal,
}

/// Exponential retry backoff: 5·2^n seconds, clamped to 10 minutes
pub fn retry_backoff_seconds(retry_count: i64) -> i64 {
    let shifted = BACKOFF_BASE_SECONDS.saturating_mul(1i64 << retry_count.clamp(0, 16));
    shifted.min(BACKOFF_MAX_SECONDS)
}

/// The durable queue
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    paused: Arc<AtomicBool>,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Insert a job, or reuse the row when a deterministic id already exists
    ///
    /// An existing live job is returned as-is (dedup); an existing terminal
    /// job is reset and queued again under the same id.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| deterministic_job_id(new.kind, new.asset_id.as_deref(), &new.payload));

        if let Some(existing) = self.get(&id).await? {
            if !existing.state().is_terminal() {
                debug!("job {} already queued, reusing", id);
                return Ok(existing);
            }

            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                UPDATE so_jobs SET
                    state = 'queued', retry_count = 0, result_json = NULL,
                    error_message = NULL, cancel_requested = 0, next_retry_at = NULL,
                    started_at = NULL, completed_at = NULL,
                    created_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(&id)
            .execute(&self.pool)
            .await?;
            self.set_progress(&id, 0.0).await?;

            return self.require(&id).await;
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO so_jobs
                (id, type, asset_id, payload_json, state, priority, retry_count,
                 max_retries, timeout_sec, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'queued', ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(new.kind.as_str())
        .bind(&new.asset_id)
        .bind(serde_json::to_string(&new.payload)?)
        .bind(new.priority.as_i64())
        .bind(new.max_retries)
        .bind(new.timeout_sec)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!("enqueued {} job {}", new.kind, id);
        self.require(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM so_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn require(&self, id: &str) -> Result<Job> {
        self.get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {}", id)))
    }

    pub async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let jobs = match state {
            Some(state) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM so_jobs WHERE state = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(state.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>("SELECT * FROM so_jobs ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    /// Claim the next queued job among the given kinds
    ///
    /// Priority decides first (critical > high > normal > low), then age.
    /// The queued→running transition is a conditional update, so two
    /// dispatchers can race without double-claiming.
    pub async fn claim_next(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
        if kinds.is_empty() || self.is_paused() {
            return Ok(None);
        }

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let select = format!(
            "SELECT * FROM so_jobs WHERE state = 'queued' AND type IN ({}) \
             ORDER BY priority DESC, created_at ASC LIMIT 1",
            placeholders
        );

        loop {
            let mut query = sqlx::query_as::<_, Job>(&select);
            for kind in kinds {
                query = query.bind(kind.as_str());
            }
            let Some(candidate) = query.fetch_optional(&self.pool).await? else {
                return Ok(None);
            };

            let now = Utc::now().to_rfc3339();
            let claimed = sqlx::query(
                r#"
                UPDATE so_jobs SET
                    state = 'running',
                    started_at = COALESCE(started_at, ?),
                    updated_at = ?
                WHERE id = ? AND state = 'queued'
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(&candidate.id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                return Ok(Some(self.require(&candidate.id).await?));
            }
            // Lost the race for this row; try the next one.
        }
    }

    /// Mark a running job completed and store its result
    pub async fn complete(&self, id: &str, result: &Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"
            UPDATE so_jobs SET
                state = 'completed', result_json = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(serde_json::to_string(result)?)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            warn!("completion of job {} ignored; not running", id);
            return Ok(());
        }
        self.set_progress(id, 100.0).await
    }

    /// Record a failure, scheduling a retry while the budget allows
    ///
    /// With retries remaining the job moves to `retrying` with a backoff
    /// deadline; otherwise it fails terminally. On the (max_retries + 1)th
    /// failure the state is `failed`, never `retrying`.
    pub async fn fail(&self, id: &str, message: &str) -> Result<JobState> {
        let job = self.require(id).await?;
        if job.state().is_terminal() {
            return Ok(job.state());
        }

        let now = Utc::now();
        if job.retry_count < job.max_retries {
            let retry_count = job.retry_count + 1;
            let delay = retry_backoff_seconds(retry_count);
            let next_retry = now + ChronoDuration::seconds(delay);

            sqlx::query(
                r#"
                UPDATE so_jobs SET
                    state = 'retrying', retry_count = ?, error_message = ?,
                    next_retry_at = ?, updated_at = ?
                WHERE id = ? AND state IN ('running', 'queued')
                "#,
            )
            .bind(retry_count)
            .bind(message)
            .bind(next_retry.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

            info!("job {} failed ({}); retry {} in {}s", id, message, retry_count, delay);
            Ok(JobState::Retrying)
        } else {
            sqlx::query(
                r#"
                UPDATE so_jobs SET
                    state = 'failed', error_message = ?, completed_at = ?, updated_at = ?
                WHERE id = ? AND state IN ('running', 'queued', 'retrying')
                "#,
            )
            .bind(message)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

            warn!("job {} failed permanently: {}", id, message);
            Ok(JobState::Failed)
        }
    }

    /// Fail a job without touching the retry budget (validation errors,
    /// cancellations observed by the supervisor)
    pub async fn fail_terminal(&self, id: &str, message: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE so_jobs SET
                state = 'failed', error_message = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND state NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(message)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Request cancellation
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let job = self.require(id).await?;
        match job.state() {
            state if state.is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
            JobState::Queued | JobState::Retrying => {
                let now = Utc::now().to_rfc3339();
                sqlx::query(
                    r#"
                    UPDATE so_jobs SET
                        state = 'cancelled', completed_at = ?, updated_at = ?
                    WHERE id = ? AND state IN ('queued', 'retrying')
                    "#,
                )
                .bind(&now)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(CancelOutcome::Cancelled)
            }
            _ => {
                sqlx::query("UPDATE so_jobs SET cancel_requested = 1, updated_at = ? WHERE id = ?")
                    .bind(Utc::now().to_rfc3339())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(CancelOutcome::Signalled)
            }
        }
    }

    /// Whether someone asked a running job to stop
    pub async fn cancel_requested(&self, id: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT cancel_requested FROM so_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0).unwrap_or(false))
    }

    /// Finalize a running job that stopped cooperatively
    pub async fn mark_cancelled(&self, id: &str, message: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE so_jobs SET
                state = 'cancelled', error_message = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(message)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move retrying jobs whose backoff elapsed back to queued
    pub async fn requeue_due_retries(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"
            UPDATE so_jobs SET state = 'queued', updated_at = ?
            WHERE state = 'retrying' AND next_retry_at <= ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    /// Last-writer-wins progress update in the side table
    pub async fn set_progress(&self, id: &str, progress: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO so_progress (job_id, progress, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                progress = excluded.progress,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(progress.clamp(0.0, 100.0))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn progress(&self, id: &str) -> Result<f64> {
        let row: Option<(f64,)> = sqlx::query_as("SELECT progress FROM so_progress WHERE job_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0).unwrap_or(0.0))
    }

    /// Poll a job until it reaches a terminal state
    pub async fn await_terminal(&self, id: &str, deadline: Duration) -> Result<Job> {
        let started = Instant::now();
        loop {
            let job = self.require(id).await?;
            if job.state().is_terminal() {
                return Ok(job);
            }
            if started.elapsed() > deadline {
                return Err(CoreError::Timeout);
            }
            sleep(Duration::from_millis(AWAIT_POLL_MS)).await;
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Job counts per state, for health/stats reporting
    pub async fn counts_by_state(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM so_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_schema, open_memory_pool};
    use crate::job::JobPriority;
    use serde_json::json;

    async fn test_queue() -> JobQueue {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        JobQueue::new(pool)
    }

    #[test]
    fn test_retry_backoff_is_clamped() {
        assert_eq!(retry_backoff_seconds(1), 10);
        assert_eq!(retry_backoff_seconds(2), 20);
        assert_eq!(retry_backoff_seconds(3), 40);
        assert_eq!(retry_backoff_seconds(10), 600);
        assert_eq!(retry_backoff_seconds(63), 600);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_dispatch() {
        let queue = test_queue().await;

        let low = queue
            .enqueue(NewJob::new(JobKind::Index, json!({"path": "/a"})).priority(JobPriority::Low))
            .await
            .unwrap();
        let normal_1 = queue
            .enqueue(NewJob::new(JobKind::Index, json!({"path": "/b"})))
            .await
            .unwrap();
        let normal_2 = queue
            .enqueue(NewJob::new(JobKind::Index, json!({"path": "/c"})))
            .await
            .unwrap();
        let critical = queue
            .enqueue(NewJob::new(JobKind::Remux, json!({"path": "/d"})).priority(JobPriority::Critical))
            .await
            .unwrap();

        let kinds = [JobKind::Index, JobKind::Remux];
        let first = queue.claim_next(&kinds).await.unwrap().unwrap();
        assert_eq!(first.id, critical.id);
        let second = queue.claim_next(&kinds).await.unwrap().unwrap();
        assert_eq!(second.id, normal_1.id);
        let third = queue.claim_next(&kinds).await.unwrap().unwrap();
        assert_eq!(third.id, normal_2.id);
        let fourth = queue.claim_next(&kinds).await.unwrap().unwrap();
        assert_eq!(fourth.id, low.id);
        assert!(queue.claim_next(&kinds).await.unwrap().is_none());

        // started_at is set on the first transition to running
        assert!(fourth.started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_respects_registered_kinds() {
        let queue = test_queue().await;
        queue
            .enqueue(NewJob::new(JobKind::Proxy, json!({"path": "/a"})))
            .await
            .unwrap();

        assert!(queue.claim_next(&[JobKind::Index]).await.unwrap().is_none());
        assert!(queue.claim_next(&[JobKind::Proxy]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminal_states_absorb() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(NewJob::new(JobKind::Remux, json!({"n": 1})))
            .await
            .unwrap();

        queue.claim_next(&[JobKind::Remux]).await.unwrap().unwrap();
        queue.complete(&job.id, &json!({"ok": true})).await.unwrap();

        // A late failure report must not move the job out of completed
        queue.fail(&job.id, "boom").await.unwrap();
        let job = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(queue.progress(&job.id).await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_retry_cycle_until_exhaustion() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(NewJob::new(JobKind::Remux, json!({"n": 2})))
            .await
            .unwrap();
        assert_eq!(job.max_retries, 3);

        for expected_retry in 1..=3 {
            queue.claim_next(&[JobKind::Remux]).await.unwrap().unwrap();
            let state = queue.fail(&job.id, "ffmpeg exploded").await.unwrap();
            assert_eq!(state, JobState::Retrying);

            let row = queue.get(&job.id).await.unwrap().unwrap();
            assert_eq!(row.retry_count, expected_retry);
            assert!(row.retry_count <= row.max_retries);

            // Nothing is dispatchable until the backoff elapses
            assert!(queue.claim_next(&[JobKind::Remux]).await.unwrap().is_none());

            // Pretend the backoff elapsed
            sqlx::query("UPDATE so_jobs SET next_retry_at = '2000-01-01T00:00:00Z' WHERE id = ?")
                .bind(&job.id)
                .execute(&queue.pool)
                .await
                .unwrap();
            assert_eq!(queue.requeue_due_retries().await.unwrap(), 1);
        }

        // Fourth failure is permanent
        queue.claim_next(&[JobKind::Remux]).await.unwrap().unwrap();
        let state = queue.fail(&job.id, "ffmpeg exploded").await.unwrap();
        assert_eq!(state, JobState::Failed);
        let row = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_retry_then_success_keeps_count() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(NewJob::new(JobKind::Remux, json!({"n": 3})))
            .await
            .unwrap();

        for _ in 0..2 {
            queue.claim_next(&[JobKind::Remux]).await.unwrap().unwrap();
            queue.fail(&job.id, "transient").await.unwrap();
            sqlx::query("UPDATE so_jobs SET next_retry_at = '2000-01-01T00:00:00Z' WHERE id = ?")
                .bind(&job.id)
                .execute(&queue.pool)
                .await
                .unwrap();
            queue.requeue_due_retries().await.unwrap();
        }

        queue.claim_next(&[JobKind::Remux]).await.unwrap().unwrap();
        queue.complete(&job.id, &json!({"ok": true})).await.unwrap();

        let row = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(row.state(), JobState::Completed);
        assert_eq!(row.retry_count, 2);
        assert_eq!(queue.progress(&job.id).await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let queue = test_queue().await;
        let queued = queue
            .enqueue(NewJob::new(JobKind::Copy, json!({"n": 4})))
            .await
            .unwrap();
        assert_eq!(queue.cancel(&queued.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(queue.get(&queued.id).await.unwrap().unwrap().state(), JobState::Cancelled);

        let running = queue
            .enqueue(NewJob::new(JobKind::Copy, json!({"n": 5})))
            .await
            .unwrap();
        queue.claim_next(&[JobKind::Copy]).await.unwrap().unwrap();
        assert_eq!(queue.cancel(&running.id).await.unwrap(), CancelOutcome::Signalled);
        assert!(queue.cancel_requested(&running.id).await.unwrap());

        queue.mark_cancelled(&running.id, "cancelled").await.unwrap();
        let row = queue.get(&running.id).await.unwrap().unwrap();
        assert_eq!(row.state(), JobState::Cancelled);
        assert_eq!(queue.cancel(&running.id).await.unwrap(), CancelOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_deterministic_enqueue_dedups() {
        let queue = test_queue().await;
        let payload = json!({"input_path": "/rec/clip.mkv", "container": "mov"});

        let a = queue
            .enqueue(NewJob::new(JobKind::Remux, payload.clone()).asset("asset1"))
            .await
            .unwrap();
        let b = queue
            .enqueue(NewJob::new(JobKind::Remux, payload.clone()).asset("asset1"))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(queue.list(None, 100).await.unwrap().len(), 1);

        // Once terminal, the same id queues again
        queue.claim_next(&[JobKind::Remux]).await.unwrap().unwrap();
        queue.complete(&a.id, &json!({})).await.unwrap();
        let c = queue
            .enqueue(NewJob::new(JobKind::Remux, payload).asset("asset1"))
            .await
            .unwrap();
        assert_eq!(c.id, a.id);
        assert_eq!(c.state(), JobState::Queued);
        assert_eq!(c.retry_count, 0);
    }

    #[tokio::test]
    async fn test_progress_last_writer_wins() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(NewJob::new(JobKind::Transcode, json!({"n": 6})))
            .await
            .unwrap();

        queue.set_progress(&job.id, 30.0).await.unwrap();
        queue.set_progress(&job.id, 72.5).await.unwrap();
        assert_eq!(queue.progress(&job.id).await.unwrap(), 72.5);

        // Values are clamped into 0..=100
        queue.set_progress(&job.id, 250.0).await.unwrap();
        assert_eq!(queue.progress(&job.id).await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_paused_queue_claims_nothing() {
        let queue = test_queue().await;
        queue
            .enqueue(NewJob::new(JobKind::Index, json!({"n": 7})))
            .await
            .unwrap();

        queue.pause();
        assert!(queue.claim_next(&[JobKind::Index]).await.unwrap().is_none());
        queue.resume();
        assert!(queue.claim_next(&[JobKind::Index]).await.unwrap().is_some());
    }
}
