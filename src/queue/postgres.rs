//! PostgreSQL job queue (`postgres` feature).
//!
//! Same contract as the SQLite backend. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent claimers skip rows another
//! transaction is already taking instead of waiting on them.
//!
//! Like the SQLite backend, every claim stamps a fresh `claim_token` and
//! the write guards match on it.

use super::{clip_error, stale_cutoff, JobQueue};
use crate::error::QueueError;
use crate::job::{now_millis, Job, JobId, JobRow, JobSchema, JobStatus, NewJob, StatusCounts};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

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

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, QueueError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations/postgres").run(pool).await?;
    info!("PostgreSQL migrations applied");
    Ok(())
}

/// [`JobQueue`] over a PostgreSQL `jobs` table.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    schema: JobSchema,
}

impl PgJobQueue {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, QueueError> {
        let pool = connect_pool(database_url, max_connections).await?;
        Self::new(pool).await
    }

    pub async fn new(pool: PgPool) -> Result<Self, QueueError> {
        let columns: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_name = 'jobs' AND table_schema = current_schema()",
        )
        .fetch_all(&pool)
        .await?;

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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append `, updated_at = <now>` when the column exists.
    fn push_touch(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        if self.schema.has_updated_at {
            qb.push(", updated_at = ");
            qb.push_bind(now_millis());
        }
    }

    /// Append `WHERE status = 'processing' AND id = <id>` plus the claim
    /// token match when the column exists.
    fn push_claim_guard(&self, qb: &mut QueryBuilder<'_, Postgres>, job: &Job) {
        qb.push(" WHERE status = 'processing' AND id = ");
        qb.push_bind(job.id.0);
        if self.schema.has_claim_token {
            qb.push(" AND claim_token = ");
            qb.push_bind(job.claim_token.clone());
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let now = now_millis();
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO jobs (user_id, filename, input_key, status, pages_done, created_at",
        );
        if self.schema.has_updated_at {
            qb.push(", updated_at");
        }
        qb.push(") VALUES (");
        qb.push_bind(job.user_id);
        qb.push(", ");
        qb.push_bind(&job.filename);
        qb.push(", ");
        qb.push_bind(&job.input_key);
        qb.push(", 'queued', 0, ");
        qb.push_bind(now);
        if self.schema.has_updated_at {
            qb.push(", ");
            qb.push_bind(now);
        }
        qb.push(") RETURNING ");
        qb.push(self.schema.select_columns());

        let row: JobRow = qb.build_query_as().fetch_one(&self.pool).await?;
        let job = Job::try_from(row)?;
        info!(job = %job.id, user = job.user_id, filename = %job.filename, "Job enqueued");
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1", self.schema.select_columns());
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list(&self, user_id: Option<i64>, limit: u32) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE ($1::BIGINT IS NULL OR user_id = $1) ORDER BY created_at, id LIMIT $2",
            self.schema.select_columns()
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(user_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE jobs SET status = 'processing'");
        self.push_touch(&mut qb);
        if self.schema.has_claim_token {
            qb.push(", claim_token = ");
            qb.push_bind(Uuid::new_v4().simple().to_string());
        }
        qb.push(
            " WHERE id = (SELECT id FROM jobs WHERE status = 'queued' \
             ORDER BY created_at, id LIMIT 1 FOR UPDATE SKIP LOCKED) RETURNING ",
        );
        qb.push(self.schema.select_columns());

        let row: Option<JobRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
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
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE jobs SET pages_done = GREATEST(pages_done, ");
        qb.push_bind(i64::from(pages_done));
        qb.push(")");
        self.push_touch(&mut qb);
        self.push_claim_guard(&mut qb, job);
        Ok(qb.build().execute(&self.pool).await?.rows_affected() == 1)
    }

    async fn heartbeat(&self, ids: &[JobId]) -> Result<u64, QueueError> {
        if ids.is_empty() || !self.schema.has_updated_at {
            return Ok(0);
        }
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let done = sqlx::query(
            "UPDATE jobs SET updated_at = $1 WHERE status = 'processing' AND id = ANY($2)",
        )
        .bind(now_millis())
        .bind(&raw)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn reclaim_stale(
        &self,
        exclude: &HashSet<JobId>,
        older_than: Duration,
    ) -> Result<Vec<JobId>, QueueError> {
        if !self.schema.has_updated_at {
            return Ok(Vec::new());
        }
        let now = now_millis();
        let excluded: Vec<i64> = exclude.iter().map(|id| id.0).collect();
        let sql = format!(
            "UPDATE jobs SET status = 'queued', updated_at = $1{} \
             WHERE status = 'processing' AND COALESCE(updated_at, created_at) < $2 \
               AND NOT (id = ANY($3)) \
             RETURNING id",
            if self.schema.has_claim_token { ", claim_token = NULL" } else { "" }
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(now)
            .bind(stale_cutoff(now, older_than))
            .bind(&excluded)
            .fetch_all(&self.pool)
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
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE jobs SET status = 'completed', error = NULL, output_key = ");
        qb.push_bind(output_key);
        qb.push(", pages_done = ");
        qb.push_bind(i64::from(pages_done));
        self.push_touch(&mut qb);
        self.push_claim_guard(&mut qb, job);
        Ok(qb.build().execute(&self.pool).await?.rows_affected() == 1)
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<bool, QueueError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE jobs SET status = 'failed', error = ");
        qb.push_bind(clip_error(error));
        self.push_touch(&mut qb);
        self.push_claim_guard(&mut qb, job);
        Ok(qb.build().execute(&self.pool).await?.rows_affected() == 1)
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
