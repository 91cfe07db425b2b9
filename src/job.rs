//! The job record as the pipeline sees it.
//!
//! A job is created `queued` with a zero progress counter by whatever layer
//! accepts uploads, then mutated exclusively by the worker:
//!
//! ```text
//! queued ──claim──▶ processing ──┬──▶ completed
//!    ▲                           └──▶ failed
//!    └──────── stale reclaim ────┘
//! ```
//!
//! `pages_done` is the resume checkpoint: the number of pages fully written
//! to the output. It only grows while the job is `processing` and equals the
//! page count once the job is `completed`.
//!
//! Every claim stamps a fresh `claim_token` on the row. Writes made on behalf
//! of a claim carry its token, so a worker whose job was reclaimed and handed
//! to someone else can no longer touch it.

use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable, monotonically assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state. Closed: any other stored value is a [`QueueError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `true` for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// One translation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque owner reference; only used to namespace object keys.
    pub user_id: i64,
    /// Original upload name, e.g. `report.pdf`.
    pub filename: String,
    /// Object key of the source PDF.
    pub input_key: String,
    /// Object key of the translated text. Set iff `status == Completed`.
    pub output_key: Option<String>,
    pub status: JobStatus,
    /// Pages fully written to the output so far.
    pub pages_done: u32,
    /// Failure reason for operators. Only set on `failed` jobs.
    pub error: Option<String>,
    /// Queue-order key.
    pub created_at: DateTime<Utc>,
    /// Last-touched time. `None` when the table has no such column.
    pub updated_at: Option<DateTime<Utc>>,
    /// Token of the claim the row is held under. `None` while queued, after
    /// a stale reclaim, or when the table has no such column.
    #[serde(skip)]
    pub claim_token: Option<String>,
}

/// Fields supplied by the upload layer when it creates a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub user_id: i64,
    pub filename: String,
    pub input_key: String,
}

/// Optional columns of the jobs table, resolved once per queue instance.
///
/// The table may be owned by the upload layer, so the worker cannot assume
/// every column it would like exists. Missing optional columns disable the
/// features that depend on them instead of failing at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSchema {
    /// Without `updated_at` there is no staleness signal: heartbeats and
    /// stale reclaim become no-ops.
    pub has_updated_at: bool,
    /// Without `claim_token` the write guards fall back to the status check
    /// alone and cannot tell one claim of a job from the next.
    pub has_claim_token: bool,
}

impl Default for JobSchema {
    fn default() -> Self {
        Self {
            has_updated_at: true,
            has_claim_token: true,
        }
    }
}

impl JobSchema {
    /// Resolve the schema from a table's column names.
    pub fn from_columns<'a>(columns: impl IntoIterator<Item = &'a str>) -> Self {
        let mut schema = Self {
            has_updated_at: false,
            has_claim_token: false,
        };
        for c in columns {
            schema.has_updated_at |= c.eq_ignore_ascii_case("updated_at");
            schema.has_claim_token |= c.eq_ignore_ascii_case("claim_token");
        }
        schema
    }

    /// Projection used by every `SELECT`/`RETURNING` in the queue backends.
    pub fn select_columns(&self) -> String {
        let updated_at = if self.has_updated_at {
            "updated_at"
        } else {
            "CAST(NULL AS BIGINT) AS updated_at"
        };
        let claim_token = if self.has_claim_token {
            "claim_token"
        } else {
            "CAST(NULL AS TEXT) AS claim_token"
        };
        format!(
            "id, user_id, filename, input_key, output_key, status, pages_done, error, created_at, {updated_at}, {claim_token}"
        )
    }
}

/// Raw row shape shared by the sqlx backends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    pub input_key: String,
    pub output_key: Option<String>,
    pub status: String,
    pub pages_done: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub claim_token: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row.status.parse()?;
        let pages_done = u32::try_from(row.pages_done).map_err(|_| QueueError::InvalidRow {
            id: row.id,
            detail: format!("pages_done out of range: {}", row.pages_done),
        })?;
        let created_at = millis_to_datetime(row.created_at).ok_or(QueueError::InvalidRow {
            id: row.id,
            detail: format!("created_at out of range: {}", row.created_at),
        })?;
        Ok(Job {
            id: JobId(row.id),
            user_id: row.user_id,
            filename: row.filename,
            input_key: row.input_key,
            output_key: row.output_key,
            status,
            pages_done,
            error: row.error,
            created_at,
            updated_at: row.updated_at.and_then(millis_to_datetime),
            claim_token: row.claim_token,
        })
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queued={} processing={} completed={} failed={}",
            self.queued, self.processing, self.completed, self.failed
        )
    }
}

/// Timestamps are stored as Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}
