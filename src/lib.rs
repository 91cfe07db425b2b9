//! # edgequake-pdf-translate
//!
//! A durable worker that translates uploaded PDF documents page by page
//! through an LLM chat-completion API.
//!
//! ## Why this crate?
//!
//! Translating a 300-page document takes hours of API calls. Workers crash,
//! get redeployed and hit rate limits in the middle of a job. This crate
//! treats every page as a checkpoint: progress is persisted after each page,
//! finished pages are kept in the object store, and a job taken over by
//! another worker resumes where the last one stopped without sending a
//! single finished page to the provider again. A chunk the provider keeps
//! rejecting is left in the source language instead of failing the job.
//!
//! ## Pipeline Overview
//!
//! ```text
//! jobs table (sqlite / postgres)
//!  │
//!  ├─ 1. Claim      oldest queued job → processing (atomic, multi-process safe)
//!  ├─ 2. Download   input PDF from the object store into a scratch dir
//!  ├─ 3. Extract    page text via pdfium, batch by batch (spawn_blocking)
//!  ├─ 4. Chunk      line-preserving split, ≤ max_chunk_chars
//!  ├─ 5. Translate  retry + backoff + fail-soft, neighbouring-page context
//!  ├─ 6. Write      "--- Page N ---" section, segment upload, checkpoint
//!  └─ 7. Finish     upload output, mark completed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf_translate::{
//!     ChatCompletionsBackend, FsObjectStore, PdfiumExtractor, Scheduler,
//!     SqliteJobQueue, TranslationClient, WorkerConfig, WorkerContext,
//! };
//! use edgequake_pdf_translate::queue::sqlite::{connect_pool, run_migrations};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkerConfig::builder().target_language("German").build()?;
//!     let pool = connect_pool("sqlite://jobs.db", 8).await?;
//!     run_migrations(&pool).await?;
//!     let queue = SqliteJobQueue::new(pool).await?;
//!     let store = FsObjectStore::new("/srv/objects", "pdfs", "https://files.example.com", "secret");
//!     let backend = ChatCompletionsBackend::new(
//!         ChatCompletionsBackend::DEFAULT_URL,
//!         std::env::var("OPENAI_API_KEY").ok(),
//!     )?;
//!     let translator = TranslationClient::new(Arc::new(backend), &config);
//!
//!     let ctx = WorkerContext::new(
//!         Arc::new(queue),
//!         Arc::new(store),
//!         Arc::new(PdfiumExtractor::new()),
//!         Arc::new(translator),
//!         config,
//!     );
//!     let stats = Scheduler::new(Arc::new(ctx)).run(CancellationToken::new()).await;
//!     eprintln!("completed: {}", stats.completed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature    | Default | Description |
//! |------------|---------|-------------|
//! | `cli`      | on      | Enables the `pdftr` binary (clap + anyhow + tracing-subscriber) |
//! | `postgres` | off     | PostgreSQL job queue with `FOR UPDATE SKIP LOCKED` claims |
//!
//! Disable `cli` when embedding the worker as a library:
//! ```toml
//! edgequake-pdf-translate = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod queue;
pub mod scheduler;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use error::{BackendError, ExtractError, PageError, QueueError, StoreError, WorkerError};
pub use job::{Job, JobId, JobSchema, JobStatus, NewJob, StatusCounts};
pub use pipeline::backend::{ChatBackend, ChatCompletionsBackend, ChatRequest, ProviderBackend};
pub use pipeline::extract::{Document, PdfiumExtractor, TextExtractor};
pub use pipeline::translate::{Translate, TranslationClient, TranslationOutcome, TranslationRequest};
pub use process::{run_job, JobReport};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
pub use queue::{JobQueue, SqliteJobQueue};
pub use scheduler::{Scheduler, SchedulerStats, WorkerContext};
pub use store::{FsObjectStore, ObjectStore};

#[cfg(feature = "postgres")]
pub use queue::PgJobQueue;
