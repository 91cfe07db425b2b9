//! Durable job queue.
//!
//! The jobs table is the only coordination point between workers. Every
//! state change is a single conditional statement, so several worker
//! processes can share one database:
//!
//! * **claim**: `queued → processing`, oldest first; two claimers never get
//!   the same job.
//! * **checkpoint / complete / fail**: take the claimed [`Job`] and only
//!   apply while the row is still `processing` under that claim's token. A
//!   `false` return means the job was reclaimed, possibly claimed again by
//!   another worker (see [`crate::error::WorkerError::ClaimLost`]).
//! * **heartbeat / reclaim_stale**: running jobs touch `updated_at`; jobs
//!   whose `updated_at` is older than the stale threshold, and that this
//!   process is not running, go back to `queued` with their checkpoint
//!   intact.
//!
//! [`sqlite::SqliteJobQueue`] is the default backend. The `postgres`
//! feature adds [`postgres::PgJobQueue`].

pub mod retry;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::QueueError;
use crate::job::{Job, JobId, NewJob, StatusCounts};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

pub use sqlite::SqliteJobQueue;

#[cfg(feature = "postgres")]
pub use postgres::PgJobQueue;

/// Persistent job store with atomic state transitions.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new `queued` job with `pages_done = 0`.
    async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Jobs ordered oldest first, optionally restricted to one owner.
    async fn list(&self, user_id: Option<i64>, limit: u32) -> Result<Vec<Job>, QueueError>;

    /// Atomically move the oldest `queued` job to `processing` under a
    /// fresh claim token and return it, with its stored `pages_done`.
    /// `None` when nothing is queued.
    async fn claim_next(&self) -> Result<Option<Job>, QueueError>;

    /// Record that `pages_done` pages of the claimed `job` are durably
    /// written. `false` if the claim no longer holds.
    async fn checkpoint(&self, job: &Job, pages_done: u32) -> Result<bool, QueueError>;

    /// Touch `updated_at` on the given `processing` jobs. Returns rows
    /// touched (0 when the table has no `updated_at`).
    async fn heartbeat(&self, ids: &[JobId]) -> Result<u64, QueueError>;

    /// Requeue `processing` jobs untouched for longer than `older_than`,
    /// skipping `exclude`, and void their claim tokens. Returns the
    /// requeued ids.
    async fn reclaim_stale(
        &self,
        exclude: &HashSet<JobId>,
        older_than: Duration,
    ) -> Result<Vec<JobId>, QueueError>;

    /// `processing → completed`, setting the output key and final counter.
    async fn complete(&self, job: &Job, output_key: &str, pages_done: u32)
        -> Result<bool, QueueError>;

    /// `processing → failed` with an operator-facing reason.
    async fn fail(&self, job: &Job, error: &str) -> Result<bool, QueueError>;

    async fn counts(&self) -> Result<StatusCounts, QueueError>;
}

/// Truncate a failure reason before it is stored.
pub(crate) fn clip_error(error: &str) -> String {
    const MAX_ERROR_CHARS: usize = 2000;
    if error.chars().count() <= MAX_ERROR_CHARS {
        error.to_string()
    } else {
        let mut s: String = error.chars().take(MAX_ERROR_CHARS).collect();
        s.push_str(" …");
        s
    }
}

/// Oldest `updated_at` (Unix ms) a `processing` job may have before it is
/// considered stale.
pub(crate) fn stale_cutoff(now_ms: i64, older_than: Duration) -> i64 {
    let window = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(window)
}
