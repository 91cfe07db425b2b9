//! Progress-callback trait for per-job events.
//!
//! Install an [`Arc<dyn JobProgressCallback>`] on the
//! [`crate::scheduler::WorkerContext`] to observe jobs as the worker drives
//! them: forward events to a metrics sink, a websocket, or a status table the
//! upload service reads. The trait is `Send + Sync` because several jobs run
//! at once and each reports from its own task.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf_translate::{JobId, JobProgressCallback};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl JobProgressCallback for PageCounter {
//!     fn on_page_complete(&self, job: JobId, page_num: usize, total_pages: usize, _chars: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("job {job}: page {page_num}/{total_pages}");
//!     }
//! }
//!
//! let counter = PageCounter(AtomicUsize::new(0));
//! counter.on_page_complete(JobId(1), 1, 3, 120);
//! assert_eq!(counter.0.load(Ordering::SeqCst), 1);
//! ```

use crate::job::JobId;
use std::sync::Arc;

/// Called by the job runner as it processes each job.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Events for different jobs interleave; events for
/// one job arrive in page order.
pub trait JobProgressCallback: Send + Sync {
    /// Called once the document is open and the page count is known.
    ///
    /// # Arguments
    /// * `total_pages`: pages in the document
    /// * `resume_from`: pages already done by an earlier attempt (0 when fresh)
    fn on_job_start(&self, job: JobId, total_pages: usize, resume_from: usize) {
        let _ = (job, total_pages, resume_from);
    }

    /// Called after a page is written to the output.
    ///
    /// # Arguments
    /// * `page_num`: 1-indexed page number
    /// * `total_pages`: pages in the document
    /// * `chars`: characters written for this page, marker excluded
    fn on_page_complete(&self, job: JobId, page_num: usize, total_pages: usize, chars: usize) {
        let _ = (job, page_num, total_pages, chars);
    }

    /// Called when a chunk kept its original text because every
    /// translation attempt failed.
    fn on_chunk_degraded(&self, job: JobId, page_num: usize, error: &str) {
        let _ = (job, page_num, error);
    }

    /// Called after the output is uploaded and the job marked `completed`.
    fn on_job_complete(&self, job: JobId, total_pages: usize, output_key: &str) {
        let _ = (job, total_pages, output_key);
    }

    /// Called after the job is marked `failed`.
    fn on_job_failed(&self, job: JobId, error: &str) {
        let _ = (job, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::scheduler::WorkerContext`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;
