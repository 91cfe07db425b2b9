//! Error types for the edgequake-pdf-translate library.
//!
//! Failures are split by how far they are allowed to travel:
//!
//! * [`WorkerError`]: **job-fatal**. The job cannot finish (input missing,
//!   document unreadable, upload failed, queue unreachable). The job runner
//!   records it on the job row and the job becomes `failed`.
//!
//! * [`PageError`]: **non-fatal**. One page could not be extracted, or one
//!   chunk could not be translated after every retry. These are absorbed
//!   where they happen (empty text, original chunk) and only logged.
//!
//! The lower-level enums ([`QueueError`], [`StoreError`], [`ExtractError`],
//! [`BackendError`]) belong to the individual collaborators and convert into
//! [`WorkerError`] where a job has to give up.

use crate::job::JobId;
use std::path::PathBuf;
use thiserror::Error;

/// All job-fatal errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    // ── Storage errors ────────────────────────────────────────────────────
    /// The input blob could not be fetched.
    #[error("Failed to download input '{key}': {source}")]
    Download {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The assembled output (or a resume segment) could not be stored.
    #[error("Failed to upload '{key}': {source}")]
    Upload {
        key: String,
        #[source]
        source: StoreError,
    },

    /// A storage transfer exceeded its deadline.
    #[error("Storage transfer for '{key}' timed out after {secs}s")]
    StorageTimeout { key: String, secs: u64 },

    // ── Document errors ───────────────────────────────────────────────────
    /// The whole document could not be opened; no page can be read.
    #[error("Cannot open document '{path}': {source}")]
    OpenDocument {
        path: PathBuf,
        #[source]
        source: ExtractError,
    },

    /// Opening or batch-reading the document exceeded its deadline.
    #[error("Opening document '{path}' timed out after {secs}s")]
    OpenTimeout { path: PathBuf, secs: u64 },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or append to the local output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Queue errors ──────────────────────────────────────────────────────
    /// The job store rejected or failed an operation.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A guarded update matched no row: the job is no longer `processing`
    /// under this worker (reclaimed as stale, or finished elsewhere).
    #[error("Job {job} is no longer held by this worker")]
    ClaimLost { job: JobId },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (panicked task, join failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page or chunk.
///
/// Never escalated into a job failure; reported through logs and the
/// [`crate::progress::JobProgressCallback`].
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Text extraction failed; the page is treated as empty.
    #[error("Page {page}: text extraction failed: {detail}")]
    ExtractFailed { page: usize, detail: String },

    /// Every translation attempt failed; the original chunk was kept.
    #[error("Page {page}, chunk {chunk}: translation failed after {attempts} attempts: {detail}")]
    TranslationFailed {
        page: usize,
        chunk: usize,
        attempts: u32,
        detail: String,
    },
}

/// Errors from a [`crate::queue::JobQueue`] backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A status column held a value outside the closed lifecycle enum.
    #[error("Invalid job status '{0}'")]
    InvalidStatus(String),

    /// A row could not be mapped onto the job model.
    #[error("Invalid job row {id}: {detail}")]
    InvalidRow { id: i64, detail: String },

    /// The jobs table has no column this backend cannot work without.
    #[error("Jobs table is missing required column '{0}'")]
    MissingColumn(String),
}

/// Errors from a [`crate::store::ObjectStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object '{key}' not found")]
    NotFound { key: String },

    /// Absolute keys and `..` segments are refused.
    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// The presign base URL cannot carry a path.
    #[error("Cannot presign '{key}': {reason}")]
    Presign { key: String, reason: String },

    #[error("Storage I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a [`crate::pipeline::extract::TextExtractor`].
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("Failed to bind to pdfium library: {0}\nSet PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.")]
    Binding(String),

    #[error("File is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: [u8; 4] },

    #[error("I/O error: {0}")]
    Io(String),

    /// PDF structure could not be parsed or requires a password.
    #[error("Corrupt or unsupported PDF: {0}")]
    Corrupt(String),

    #[error("Page {page} out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// A single page failed to yield text.
    #[error("Page {page}: {detail}")]
    Page { page: usize, detail: String },
}

/// Errors from a single chat-completion call. Always retryable.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The endpoint answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, TLS or body-read failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Success status, but no `choices[0].message.content` in the body.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Error surfaced by an edgequake-llm provider.
    #[error("Provider '{provider}' error: {detail}")]
    Provider { provider: String, detail: String },

    /// The per-call deadline passed.
    #[error("Timed out after {secs}s")]
    Timeout { secs: u64 },
}
