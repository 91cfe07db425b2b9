//! One claimed job, end to end.
//!
//! ```text
//! download ──▶ open ──▶ restore segments ──▶ ┌ page loop ─────────────────────┐ ──▶ upload ──▶ complete
//! (store)     (pdfium)  (resume only)        │ chunk → translate → write page │     (store)    (queue)
//!                                            │ → upload segment → checkpoint  │
//!                                            └────────────────────────────────┘
//! ```
//!
//! Everything local lives in a per-job scratch directory that is removed
//! when the job returns, whatever the outcome. Durable state is the job row
//! (`pages_done`) plus one segment object per written page, which is what a
//! resumed attempt restores its output from.

use crate::error::{PageError, StoreError, WorkerError};
use crate::job::{Job, JobId};
use crate::pipeline::chunk;
use crate::pipeline::context;
use crate::pipeline::extract::{CursorPage, Document, PageCursor};
use crate::pipeline::output::OutputWriter;
use crate::pipeline::translate::TranslationRequest;
use crate::scheduler::WorkerContext;
use crate::store::{output_key, partial_prefix, segment_key};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Summary of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job: JobId,
    pub total_pages: usize,
    /// Pages restored from an earlier attempt.
    pub resumed_from: usize,
    /// Pages processed by this attempt.
    pub pages_processed: usize,
    /// Chunks whose translation failed and were kept in the source language.
    pub degraded_chunks: usize,
    pub output_key: String,
    pub elapsed: Duration,
}

/// Log correlation id for one attempt at a job: `job{id}-{8 hex chars}`.
pub fn request_id(job: JobId) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("job{job}-{}", &uuid[..8])
}

/// Run a claimed job to a terminal state.
///
/// On error the job is marked `failed` (unless the claim was lost to
/// another worker, in which case the row is left alone) and the error is
/// returned for the caller's bookkeeping.
pub async fn run_job(ctx: &WorkerContext, job: Job) -> Result<JobReport, WorkerError> {
    let span = info_span!("job", id = %job.id, req = %request_id(job.id));
    async {
        info!(
            filename = %job.filename,
            user = job.user_id,
            pages_done = job.pages_done,
            "Job started"
        );

        match execute(ctx, &job).await {
            Ok(report) => {
                info!(
                    pages = report.total_pages,
                    resumed_from = report.resumed_from,
                    degraded_chunks = report.degraded_chunks,
                    output = %report.output_key,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Job completed"
                );
                Ok(report)
            }
            Err(e @ WorkerError::ClaimLost { .. }) => {
                warn!("{e}; abandoning without touching the job row");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Job failed");
                record_failure(ctx, &job, &e.to_string()).await;
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

/// Mark `job` failed, notify the progress callback and drop its resume
/// segments. Used for errors and for panicked job tasks.
pub(crate) async fn record_failure(ctx: &WorkerContext, job: &Job, message: &str) {
    match ctx.queue.fail(job, message).await {
        Ok(true) => {
            ctx.progress.on_job_failed(job.id, message);
            discard_segments(ctx, job).await;
        }
        Ok(false) => warn!("Job is no longer processing; failure not recorded"),
        Err(e) => error!(
            error = %e,
            "Could not record job failure; it will be requeued once stale"
        ),
    }
}

async fn execute(ctx: &WorkerContext, job: &Job) -> Result<JobReport, WorkerError> {
    let started = Instant::now();
    let cfg = &ctx.config;

    let scratch_root = cfg.scratch_root();
    let scratch = tempfile::Builder::new()
        .prefix(&format!("pdftr-job{}-", job.id))
        .tempdir_in(&scratch_root)
        .map_err(|source| WorkerError::OutputWriteFailed {
            path: scratch_root.clone(),
            source,
        })?;

    // ── Input ────────────────────────────────────────────────────────────
    let input_path = scratch.path().join("input.pdf");
    with_deadline(
        cfg.storage_timeout(),
        &job.input_key,
        ctx.store.download(&job.input_key, &input_path),
    )
    .await?
    .map_err(|source| WorkerError::Download {
        key: job.input_key.clone(),
        source,
    })?;

    let doc = Document::open(Arc::clone(&ctx.extractor), &input_path, cfg.open_timeout()).await?;
    let total = doc.page_count();

    // ── Resume ───────────────────────────────────────────────────────────
    let output_path = scratch.path().join("output.txt");
    let mut resume_from = (job.pages_done as usize).min(total);
    if resume_from > 0 && !restore_segments(ctx, job, resume_from, &output_path).await? {
        resume_from = 0;
    }
    if resume_from > 0 {
        info!(resume_from, total, "Resuming from checkpoint");
    }
    ctx.progress.on_job_start(job.id, total, resume_from);

    // ── Page loop ────────────────────────────────────────────────────────
    let mut writer = OutputWriter::open(&output_path, resume_from > 0).await?;
    let mut cursor = PageCursor::new(&doc, resume_from, cfg.page_batch_size).await?;
    let mut pages_processed = 0usize;
    let mut degraded_chunks = 0usize;
    let every = cfg.checkpoint_every_pages.max(1) as usize;

    while let Some(page) = cursor.advance().await? {
        let page_num = page.index + 1;
        let page_started = Instant::now();

        let (text, degraded) = translate_page(ctx, job.id, &page).await;
        degraded_chunks += degraded;

        let section = writer.write_page(page_num, text.as_deref()).await?;
        let seg = segment_key(job.user_id, job.id, page_num);
        with_deadline(cfg.storage_timeout(), &seg, ctx.store.put(&seg, section.as_bytes()))
            .await?
            .map_err(|source| WorkerError::Upload { key: seg.clone(), source })?;
        pages_processed += 1;

        let chars = text.as_deref().map_or(0, |t| t.chars().count());
        info!(
            page = page_num,
            total,
            chars,
            degraded,
            elapsed_ms = page_started.elapsed().as_millis() as u64,
            "Page written"
        );
        ctx.progress.on_page_complete(job.id, page_num, total, chars);

        if page_num < total && page_num % every == 0 {
            let done = u32::try_from(page_num).unwrap_or(u32::MAX);
            if !ctx.queue.checkpoint(job, done).await? {
                return Err(WorkerError::ClaimLost { job: job.id });
            }
            debug!(pages_done = done, "Checkpoint saved");
        }
    }

    // ── Output ───────────────────────────────────────────────────────────
    let written = writer.bytes_written();
    let output_path = writer.finish().await?;
    let out_key = output_key(job.user_id, job.id, &job.filename);
    with_deadline(
        cfg.storage_timeout(),
        &out_key,
        ctx.store.upload(&output_path, &out_key),
    )
    .await?
    .map_err(|source| WorkerError::Upload {
        key: out_key.clone(),
        source,
    })?;
    debug!(key = %out_key, bytes_this_attempt = written, "Output uploaded");

    let total_u32 = u32::try_from(total).unwrap_or(u32::MAX);
    if !ctx.queue.complete(job, &out_key, total_u32).await? {
        return Err(WorkerError::ClaimLost { job: job.id });
    }
    discard_segments(ctx, job).await;
    ctx.progress.on_job_complete(job.id, total, &out_key);

    Ok(JobReport {
        job: job.id,
        total_pages: total,
        resumed_from: resume_from,
        pages_processed,
        degraded_chunks,
        output_key: out_key,
        elapsed: started.elapsed(),
    })
}

/// Translate one page chunk by chunk. Returns `None` for a page without
/// text, and the number of chunks that fell back to the source text.
async fn translate_page(ctx: &WorkerContext, job: JobId, page: &CursorPage) -> (Option<String>, usize) {
    let page_num = page.index + 1;
    if page.text.trim().is_empty() {
        debug!(page = page_num, "Page has no text");
        return (None, 0);
    }

    let cfg = &ctx.config;
    let chunks = chunk::split(&page.text, cfg.max_chunk_chars);
    let previous = page
        .previous
        .as_deref()
        .map(|p| context::tail(p, cfg.context_chars))
        .filter(|s| !s.is_empty());
    let next = page
        .next
        .as_deref()
        .map(|n| context::head(n, cfg.lookahead_chars))
        .filter(|s| !s.is_empty());

    let n = chunks.len();
    let mut out = String::with_capacity(page.text.len());
    let mut degraded = 0;
    for (i, piece) in chunks.iter().copied().enumerate() {
        let part = format!("p{page_num}.c{}/{n}", i + 1);
        let request = TranslationRequest {
            chunk: piece,
            context: if i == 0 { previous } else { None },
            lookahead: if i + 1 == n { next } else { None },
            part: &part,
        };
        let outcome = ctx.translator.translate(&request).await;
        if let Some(detail) = outcome.degraded {
            degraded += 1;
            let err = PageError::TranslationFailed {
                page: page_num,
                chunk: i + 1,
                attempts: outcome.attempts,
                detail,
            };
            warn!(chunk = %format!("{}/{n}", i + 1), "{err}");
            ctx.progress.on_chunk_degraded(job, page_num, &err.to_string());
        }
        out.push_str(&outcome.text);
    }
    (Some(out), degraded)
}

/// Rebuild the first `pages` sections of the output from their segment
/// objects. `false` when a segment is missing and the job has to start over.
async fn restore_segments(
    ctx: &WorkerContext,
    job: &Job,
    pages: usize,
    output_path: &Path,
) -> Result<bool, WorkerError> {
    let mut writer = OutputWriter::open(output_path, false).await?;
    for page_num in 1..=pages {
        let key = segment_key(job.user_id, job.id, page_num);
        let fetched = with_deadline(ctx.config.storage_timeout(), &key, ctx.store.get(&key)).await?;
        match fetched {
            Ok(bytes) => writer.write_raw(&bytes).await?,
            Err(StoreError::NotFound { .. }) => {
                warn!(
                    page = page_num,
                    checkpoint = pages,
                    "Resume segment missing; restarting the job from page 1"
                );
                return Ok(false);
            }
            Err(source) => return Err(WorkerError::Download { key, source }),
        }
    }
    writer.finish().await?;
    debug!(pages, "Restored output from segments");
    Ok(true)
}

async fn discard_segments(ctx: &WorkerContext, job: &Job) {
    let prefix = partial_prefix(job.user_id, job.id);
    let outcome = tokio::time::timeout(ctx.config.storage_timeout(), ctx.store.delete_prefix(&prefix)).await;
    match outcome {
        Ok(Ok(n)) => debug!(removed = n, "Resume segments removed"),
        Ok(Err(e)) => warn!(error = %e, "Could not remove resume segments"),
        Err(_) => warn!("Timed out removing resume segments"),
    }
}

/// Bound a storage transfer by the configured deadline.
async fn with_deadline<T>(
    limit: Duration,
    key: &str,
    transfer: impl Future<Output = Result<T, StoreError>>,
) -> Result<Result<T, StoreError>, WorkerError> {
    tokio::time::timeout(limit, transfer)
        .await
        .map_err(|_| WorkerError::StorageTimeout {
            key: key.to_string(),
            secs: limit.as_secs(),
        })
}
