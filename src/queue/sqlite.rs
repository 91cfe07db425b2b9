//! SQLite job queue.
//!
//! One database file shared by any number of worker processes. The pool runs
//! in WAL mode with a generous busy timeout, and every write goes through
//! [`retry_on_busy`] for the lock errors that still slip through.
//!
//! Claims are a single `UPDATE … WHERE id = (SELECT … LIMIT 1) AND
//! status = 'queued' RETURNING …` statement. SQLite serialises writers, so
//! the inner select and the update see the same snapshot and two claimers
//! can never both match the same row.
//!
//! The claim also stamps a fresh token on the row; checkpoint, complete and
//! fail match on it, so they stop working for a holder whose job was
//! reclaimed even after someone else has claimed it again.

use super::retry::retry_on_busy;
use super::{clip_error, stale_cutoff, JobQueue};
use crate::error::QueueError;
use crate::job::{now_millis, Job, JobId, JobRow, JobSchema, JobStatus, NewJob, StatusCounts};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Columns the worker cannot run without. `updated_at` and `claim_token`
/// are optional.
const REQUIRED_COLUMNS: [&str; 9] = [
    "id",
    "user_id",
    "filename",
    "input_key",
    "output_key",
    "status",
    "pages_done",
    "error",
    "created_at",
];

/// Open a WAL-mode pool on `database_url` (e.g. `sqlite://jobs.db`),
/// creating the file if needed.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, QueueError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Apply the bundled migrations (creates the `jobs` table).
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations/sqlite").run(pool).await?;
    info!("SQLite migrations applied");
    Ok(())
}

/// [`JobQueue`] over a SQLite `jobs` table.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    schema: JobSchema,
}

impl SqliteJobQueue {
    /// Connect and inspect the table schema. The table must already exist
    /// (see [`run_migrations`]).
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, QueueError> {
        let pool = connect_pool(database_url, max_connections).await?;
        Self::new(pool).await
    }

    /// Wrap an existing pool, detecting which optional columns exist.
    pub async fn new(pool: SqlitePool) -> Result<Self, QueueError> {
        let rows = sqlx::query("PRAGMA table_info(jobs)").fetch_all(&pool).await?;
        let columns = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(missing) = REQUIRED_COLUMNS
            .iter()
            .find(|req| !columns.iter().any(|c| c.eq_ignore_ascii_case(req)))
        {
            return Err(QueueError::MissingColumn((*missing).to_string()));
        }

        let schema = JobSchema::from_columns(columns.iter().map(String::as_str));
        if !schema.has_updated_at {
            warn!("jobs table has no updated_at column; heartbeats and stale reclaim are disabled");
        }
        if !schema.has_claim_token {
            warn!("jobs table has no claim_token column; a reclaimed job's old holder is only detected by status");
        }
        Ok(Self { pool, schema })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema(&self) -> JobSchema {
        self.schema
    }

    /// `, updated_at = ?` when the column exists.
    fn touch(&self) -> &'static str {
        if self.schema.has_updated_at {
            ", updated_at = ?"
        } else {
            ""
        }
    }

    /// ` AND claim_token = ?` when the column exists.
    fn claim_guard(&self) -> &'static str {
        if self.schema.has_claim_token {
            " AND claim_token = ?"
        } else {
            ""
        }
    }

    async fn fetch_job(&self, sql: &str, id: i64) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let cols = self.schema.select_columns();
        let sql = if self.schema.has_updated_at {
            format!(
                "INSERT INTO jobs (user_id, filename, input_key, status, pages_done, created_at, updated_at) \
                 VALUES (?, ?, ?, 'queued', 0, ?, ?) RETURNING {cols}"
            )
        } else {
            format!(
                "INSERT INTO jobs (user_id, filename, input_key, status, pages_done, created_at) \
                 VALUES (?, ?, ?, 'queued', 0, ?) RETURNING {cols}"
            )
        };
        let pool = &self.pool;
        let has_updated_at = self.schema.has_updated_at;

        let row = retry_on_busy("enqueue", || {
            let now = now_millis();
            let mut q = sqlx::query_as::<_, JobRow>(&sql)
                .bind(job.user_id)
                .bind(&job.filename)
                .bind(&job.input_key)
                .bind(now);
            if has_updated_at {
                q = q.bind(now);
            }
            async move { Ok(q.fetch_one(pool).await?) }
        })
        .await?;

        let job = Job::try_from(row)?;
        info!(job = %job.id, user = job.user_id, filename = %job.filename, "Job enqueued");
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", self.schema.select_columns());
        self.fetch_job(&sql, id.0).await
    }

    async fn list(&self, user_id: Option<i64>, limit: u32) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE (? IS NULL OR user_id = ?) ORDER BY created_at, id LIMIT ?",
            self.schema.select_columns()
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(user_id)
            .bind(user_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let sql = format!(
            "UPDATE jobs SET status = 'processing'{touch}{token} \
             WHERE id = (SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at, id LIMIT 1) \
               AND status = 'queued' \
             RETURNING {cols}",
            touch = self.touch(),
            token = if self.schema.has_claim_token { ", claim_token = ?" } else { "" },
            cols = self.schema.select_columns(),
        );
        let pool = &self.pool;
        let JobSchema {
            has_updated_at,
            has_claim_token,
        } = self.schema;

        let row = retry_on_busy("claim_next", || {
            let mut q = sqlx::query_as::<_, JobRow>(&sql);
            if has_updated_at {
                q = q.bind(now_millis());
            }
            if has_claim_token {
                q = q.bind(Uuid::new_v4().simple().to_string());
            }
            async move { Ok(q.fetch_optional(pool).await?) }
        })
        .await?;

        match row {
            Some(row) => {
                let job = Job::try_from(row)?;
                debug!(job = %job.id, pages_done = job.pages_done, "Claimed job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn checkpoint(&self, job: &Job, pages_done: u32) -> Result<bool, QueueError> {
        let sql = format!(
            "UPDATE jobs SET pages_done = MAX(pages_done, ?){} WHERE id = ? AND status = 'processing'{}",
            self.touch(),
            self.claim_guard()
        );
        let pool = &self.pool;
        let JobSchema {
            has_updated_at,
            has_claim_token,
        } = self.schema;

        let affected = retry_on_busy("checkpoint", || {
            let mut q = sqlx::query(&sql).bind(i64::from(pages_done));
            if has_updated_at {
                q = q.bind(now_millis());
            }
            q = q.bind(job.id.0);
            if has_claim_token {
                q = q.bind(job.claim_token.as_deref());
            }
            async move { Ok(q.execute(pool).await?.rows_affected()) }
        })
        .await?;
        Ok(affected == 1)
    }

    async fn heartbeat(&self, ids: &[JobId]) -> Result<u64, QueueError> {
        if ids.is_empty() || !self.schema.has_updated_at {
            return Ok(0);
        }
        let pool = &self.pool;
        retry_on_busy("heartbeat", || {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET updated_at = ");
            qb.push_bind(now_millis());
            qb.push(" WHERE status = 'processing' AND id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.0);
            }
            qb.push(")");
            async move { Ok(qb.build().execute(pool).await?.rows_affected()) }
        })
        .await
    }

    async fn reclaim_stale(
        &self,
        exclude: &HashSet<JobId>,
        older_than: Duration,
    ) -> Result<Vec<JobId>, QueueError> {
        if !self.schema.has_updated_at {
            return Ok(Vec::new());
        }
        let pool = &self.pool;
        let has_claim_token = self.schema.has_claim_token;
        let ids: Vec<i64> = retry_on_busy("reclaim_stale", || {
            let now = now_millis();
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE jobs SET status = 'queued', updated_at = ");
            qb.push_bind(now);
            if has_claim_token {
                qb.push(", claim_token = NULL");
            }
            qb.push(" WHERE status = 'processing' AND COALESCE(updated_at, created_at) < ");
            qb.push_bind(stale_cutoff(now, older_than));
            if !exclude.is_empty() {
                qb.push(" AND id NOT IN (");
                let mut sep = qb.separated(", ");
                for id in exclude {
                    sep.push_bind(id.0);
                }
                qb.push(")");
            }
            qb.push(" RETURNING id");
            async move { Ok(qb.build_query_scalar::<i64>().fetch_all(pool).await?) }
        })
        .await?;

        let ids: Vec<JobId> = ids.into_iter().map(JobId).collect();
        if !ids.is_empty() {
            warn!(jobs = ?ids, "Requeued stale processing jobs");
        }
        Ok(ids)
    }

    async fn complete(
        &self,
        job: &Job,
        output_key: &str,
        pages_done: u32,
    ) -> Result<bool, QueueError> {
        let sql = format!(
            "UPDATE jobs SET status = 'completed', output_key = ?, pages_done = ?, error = NULL{} \
             WHERE id = ? AND status = 'processing'{}",
            self.touch(),
            self.claim_guard()
        );
        let pool = &self.pool;
        let JobSchema {
            has_updated_at,
            has_claim_token,
        } = self.schema;

        let affected = retry_on_busy("complete", || {
            let mut q = sqlx::query(&sql).bind(output_key).bind(i64::from(pages_done));
            if has_updated_at {
                q = q.bind(now_millis());
            }
            q = q.bind(job.id.0);
            if has_claim_token {
                q = q.bind(job.claim_token.as_deref());
            }
            async move { Ok(q.execute(pool).await?.rows_affected()) }
        })
        .await?;
        Ok(affected == 1)
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<bool, QueueError> {
        let sql = format!(
            "UPDATE jobs SET status = 'failed', error = ?{} WHERE id = ? AND status = 'processing'{}",
            self.touch(),
            self.claim_guard()
        );
        let error = clip_error(error);
        let pool = &self.pool;
        let JobSchema {
            has_updated_at,
            has_claim_token,
        } = self.schema;

        let affected = retry_on_busy("fail", || {
            let mut q = sqlx::query(&sql).bind(error.as_str());
            if has_updated_at {
                q = q.bind(now_millis());
            }
            q = q.bind(job.id.0);
            if has_claim_token {
                q = q.bind(job.claim_token.as_deref());
            }
            async move { Ok(q.execute(pool).await?.rows_affected()) }
        })
        .await?;
        Ok(affected == 1)
    }

    async fn counts(&self) -> Result<StatusCounts, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse::<JobStatus>()?, n.max(0) as u64);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::task::JoinSet;

    async fn queue() -> (TempDir, SqliteJobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = connect_pool(&url, 8).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, SqliteJobQueue::new(pool).await.unwrap())
    }

    fn new_job(name: &str) -> NewJob {
        NewJob {
            user_id: 1,
            filename: name.into(),
            input_key: format!("inputs/1/abc_{name}"),
        }
    }

    async fn backdate(q: &SqliteJobQueue, id: JobId, by: Duration) {
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(now_millis() - by.as_millis() as i64)
            .bind(id.0)
            .execute(q.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn enqueue_then_claim_fifo() {
        let (_dir, q) = queue().await;
        let a = q.enqueue(new_job("a.pdf")).await.unwrap();
        let b = q.enqueue(new_job("b.pdf")).await.unwrap();
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.pages_done, 0);

        let first = q.claim_next().await.unwrap().unwrap();
        let second = q.claim_next().await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert_eq!(first.status, JobStatus::Processing);
        assert!(q.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_are_exclusive() {
        let (_dir, q) = queue().await;
        for i in 0..20 {
            q.enqueue(new_job(&format!("{i}.pdf"))).await.unwrap();
        }
        let q = Arc::new(q);
        let mut set = JoinSet::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            set.spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = q.claim_next().await.unwrap() {
                    mine.push(job.id);
                }
                mine
            });
        }
        let mut all = Vec::new();
        while let Some(res) = set.join_next().await {
            all.extend(res.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 20);
        assert_eq!(all.len(), 20, "a job was claimed twice");
    }

    #[tokio::test]
    async fn checkpoint_only_while_processing() {
        let (_dir, q) = queue().await;
        let job = q.enqueue(new_job("a.pdf")).await.unwrap();
        assert!(!q.checkpoint(&job, 1).await.unwrap(), "queued job accepted a checkpoint");

        let claimed = q.claim_next().await.unwrap().unwrap();
        assert!(claimed.claim_token.is_some());
        assert!(q.checkpoint(&claimed, 2).await.unwrap());
        assert!(q.checkpoint(&claimed, 1).await.unwrap());
        assert_eq!(q.get(job.id).await.unwrap().unwrap().pages_done, 2, "counter went backwards");
        assert!(!q.checkpoint(&job, 3).await.unwrap(), "write without the claim token accepted");
    }

    #[tokio::test]
    async fn complete_and_fail_are_guarded() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        q.enqueue(new_job("b.pdf")).await.unwrap();
        let a = q.claim_next().await.unwrap().unwrap();
        let b = q.claim_next().await.unwrap().unwrap();

        assert!(q.complete(&a, "outputs/1/translated_1_a.txt", 3).await.unwrap());
        assert!(!q.fail(&a, "late failure").await.unwrap());
        assert!(q.fail(&b, "boom").await.unwrap());

        let a = q.get(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Completed);
        assert_eq!(a.pages_done, 3);
        assert_eq!(a.output_key.as_deref(), Some("outputs/1/translated_1_a.txt"));
        let b = q.get(b.id).await.unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Failed);
        assert_eq!(b.error.as_deref(), Some("boom"));

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn stale_jobs_are_requeued_unless_active() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        q.enqueue(new_job("b.pdf")).await.unwrap();
        let held = q.claim_next().await.unwrap().unwrap();
        let b = q.claim_next().await.unwrap().unwrap();
        q.checkpoint(&held, 4).await.unwrap();
        backdate(&q, held.id, Duration::from_secs(7200)).await;
        backdate(&q, b.id, Duration::from_secs(7200)).await;

        let active: HashSet<JobId> = [b.id].into_iter().collect();
        let reclaimed = q.reclaim_stale(&active, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(reclaimed, vec![held.id]);

        let a = q.get(held.id).await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.pages_done, 4, "checkpoint lost on reclaim");
        assert_eq!(q.get(b.id).await.unwrap().unwrap().status, JobStatus::Processing);

        // The original holder has lost the job.
        assert!(!q.checkpoint(&held, 5).await.unwrap());
        assert!(a.claim_token.is_none(), "reclaim left the token in place");
        let resumed = q.claim_next().await.unwrap().unwrap();
        assert_eq!(resumed.id, a.id);
        assert_eq!(resumed.pages_done, 4);
    }

    #[tokio::test]
    async fn reclaimed_job_rejects_its_previous_holder() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        let first = q.claim_next().await.unwrap().unwrap();
        q.checkpoint(&first, 2).await.unwrap();
        backdate(&q, first.id, Duration::from_secs(7200)).await;
        q.reclaim_stale(&HashSet::new(), Duration::from_secs(3600))
            .await
            .unwrap();

        let second = q.claim_next().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, JobStatus::Processing);
        assert_ne!(second.claim_token, first.claim_token);

        assert!(!q.checkpoint(&first, 9).await.unwrap(), "stale holder checkpointed");
        assert!(!q.complete(&first, "outputs/1/stale.txt", 9).await.unwrap(), "stale holder completed");
        assert!(!q.fail(&first, "stale").await.unwrap(), "stale holder failed the job");

        assert!(q.checkpoint(&second, 3).await.unwrap());
        assert!(q.complete(&second, "outputs/1/live.txt", 3).await.unwrap());
        let done = q.get(first.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.output_key.as_deref(), Some("outputs/1/live.txt"));
        assert_eq!(done.pages_done, 3);
    }

    #[tokio::test]
    async fn heartbeat_keeps_jobs_fresh() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        let a = q.claim_next().await.unwrap().unwrap();
        backdate(&q, a.id, Duration::from_secs(7200)).await;

        assert_eq!(q.heartbeat(&[a.id]).await.unwrap(), 1);
        let reclaimed = q
            .reclaim_stale(&HashSet::new(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(q.heartbeat(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn table_without_updated_at_still_works() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("legacy.db").display());
        let pool = connect_pool(&url, 2).await.unwrap();
        sqlx::query(
            "CREATE TABLE jobs (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER NOT NULL, \
             filename TEXT NOT NULL, input_key TEXT NOT NULL, output_key TEXT, status TEXT NOT NULL, \
             pages_done INTEGER NOT NULL DEFAULT 0, error TEXT, created_at INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let q = SqliteJobQueue::new(pool).await.unwrap();
        assert!(!q.schema().has_updated_at);
        assert!(!q.schema().has_claim_token);
        let job = q.enqueue(new_job("a.pdf")).await.unwrap();
        assert!(job.updated_at.is_none());
        let job = q.claim_next().await.unwrap().unwrap();
        assert!(job.claim_token.is_none());
        assert!(q.checkpoint(&job, 1).await.unwrap());
        assert_eq!(q.heartbeat(&[job.id]).await.unwrap(), 0);
        assert!(q
            .reclaim_stale(&HashSet::new(), Duration::from_secs(1))
            .await
            .unwrap()
            .is_empty());
        assert!(q.complete(&job, "outputs/1/x.txt", 1).await.unwrap());
    }

    #[tokio::test]
    async fn missing_required_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("bad.db").display());
        let pool = connect_pool(&url, 1).await.unwrap();
        sqlx::query("CREATE TABLE jobs (id INTEGER PRIMARY KEY, status TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        let err = SqliteJobQueue::new(pool).await.unwrap_err();
        assert!(matches!(err, QueueError::MissingColumn(ref c) if c == "user_id"));
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let (_dir, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        q.enqueue(NewJob {
            user_id: 2,
            filename: "b.pdf".into(),
            input_key: "inputs/2/x_b.pdf".into(),
        })
        .await
        .unwrap();
        assert_eq!(q.list(None, 10).await.unwrap().len(), 2);
        let mine = q.list(Some(2), 10).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].filename, "b.pdf");
    }
}
