//! End-to-end worker scenarios: SQLite job table, filesystem object store,
//! a text-file "PDF" extractor and scripted translators.
//!
//! Run with:
//!   cargo test --test pipeline

use async_trait::async_trait;
use edgequake_pdf_translate::prompts::ALL_DELIMITERS;
use edgequake_pdf_translate::queue::sqlite::{connect_pool, run_migrations};
use edgequake_pdf_translate::store::{input_key, partial_prefix, segment_key};
use edgequake_pdf_translate::{
    run_job, BackendError, ChatBackend, ChatRequest, ExtractError, FsObjectStore, Job, JobId,
    JobProgressCallback, JobQueue, JobStatus, NewJob, ObjectStore, Scheduler, SqliteJobQueue,
    StoreError, TextExtractor, Translate, TranslationClient, TranslationOutcome,
    TranslationRequest, WorkerConfig, WorkerContext, WorkerError,
};
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ── Test doubles ─────────────────────────────────────────────────────────

/// Pages are the form-feed-separated sections of a UTF-8 file.
struct FormFeedExtractor;

impl FormFeedExtractor {
    fn pages(path: &Path) -> Result<Vec<String>, ExtractError> {
        let text = std::fs::read_to_string(path).map_err(|e| ExtractError::Io(e.to_string()))?;
        Ok(text.split('\x0c').map(str::to_string).collect())
    }
}

impl TextExtractor for FormFeedExtractor {
    fn page_count(&self, path: &Path) -> Result<usize, ExtractError> {
        Ok(Self::pages(path)?.len())
    }

    fn extract_pages(
        &self,
        path: &Path,
        pages: Range<usize>,
    ) -> Result<Vec<Result<String, ExtractError>>, ExtractError> {
        let all = Self::pages(path)?;
        Ok(pages
            .map(|i| {
                all.get(i).cloned().ok_or(ExtractError::PageOutOfRange {
                    page: i + 1,
                    total: all.len(),
                })
            })
            .collect())
    }
}

/// Answers `<TR:{chunk}>`. Optionally never answers call number `hang_at`
/// (0-based), which stands in for a worker that dies mid-job.
#[derive(Default)]
struct MarkingTranslator {
    calls: Mutex<Vec<String>>,
    hang_at: Option<usize>,
}

impl MarkingTranslator {
    fn hanging_at(call: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            hang_at: Some(call),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Translate for MarkingTranslator {
    async fn translate(&self, request: &TranslationRequest<'_>) -> TranslationOutcome {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.chunk.to_string());
            calls.len() - 1
        };
        if self.hang_at == Some(n) {
            std::future::pending::<()>().await;
        }
        TranslationOutcome {
            text: format!("<TR:{}>", request.chunk),
            attempts: 1,
            degraded: None,
        }
    }
}

struct PanickingTranslator;

#[async_trait]
impl Translate for PanickingTranslator {
    async fn translate(&self, _request: &TranslationRequest<'_>) -> TranslationOutcome {
        panic!("translator exploded");
    }
}

/// A model that repeats the whole request back, delimiters and hints included.
struct EchoBackend;

#[async_trait]
impl ChatBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
        Ok(request.user.to_string())
    }
}

struct DownBackend;

#[async_trait]
impl ChatBackend for DownBackend {
    fn name(&self) -> &str {
        "down"
    }

    async fn complete(&self, _request: &ChatRequest<'_>) -> Result<String, BackendError> {
        Err(BackendError::Http {
            status: 503,
            body: "service unavailable".into(),
        })
    }
}

#[derive(Default)]
struct RecordingProgress {
    starts: Mutex<Vec<(JobId, usize, usize)>>,
    pages: Mutex<Vec<usize>>,
    degraded: Mutex<Vec<usize>>,
    failed: Mutex<Vec<String>>,
}

impl JobProgressCallback for RecordingProgress {
    fn on_job_start(&self, job: JobId, total_pages: usize, resume_from: usize) {
        self.starts.lock().unwrap().push((job, total_pages, resume_from));
    }

    fn on_page_complete(&self, _job: JobId, page_num: usize, _total: usize, _chars: usize) {
        self.pages.lock().unwrap().push(page_num);
    }

    fn on_chunk_degraded(&self, _job: JobId, page_num: usize, _error: &str) {
        self.degraded.lock().unwrap().push(page_num);
    }

    fn on_job_failed(&self, _job: JobId, error: &str) {
        self.failed.lock().unwrap().push(error.to_string());
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    dir: TempDir,
    queue: Arc<SqliteJobQueue>,
    store: Arc<FsObjectStore>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("objects")).unwrap();
        std::fs::create_dir_all(dir.path().join("scratch")).unwrap();
        let pool = connect_pool(&Self::db_url(&dir), 8).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = Arc::new(SqliteJobQueue::new(pool).await.unwrap());
        let store = Arc::new(FsObjectStore::new(
            dir.path().join("objects"),
            "pdfs",
            "http://localhost:9000",
            "test-secret",
        ));
        Self { dir, queue, store }
    }

    fn db_url(dir: &TempDir) -> String {
        format!("sqlite://{}", dir.path().join("jobs.db").display())
    }

    /// A second, independent queue on the same database file.
    async fn second_queue(&self) -> Arc<SqliteJobQueue> {
        let pool = connect_pool(&Self::db_url(&self.dir), 8).await.unwrap();
        Arc::new(SqliteJobQueue::new(pool).await.unwrap())
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig::builder()
            .work_dir(self.dir.path().join("scratch"))
            .poll_interval_secs(1)
            .max_concurrent_jobs(2)
            .max_retries(1)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    fn context(&self, translator: Arc<dyn Translate>) -> WorkerContext {
        self.context_with(self.queue.clone(), translator, self.config())
    }

    fn context_with(
        &self,
        queue: Arc<dyn JobQueue>,
        translator: Arc<dyn Translate>,
        config: WorkerConfig,
    ) -> WorkerContext {
        WorkerContext::new(
            queue,
            self.store.clone(),
            Arc::new(FormFeedExtractor),
            translator,
            config,
        )
    }

    async fn submit(&self, user: i64, filename: &str, pages: &[&str]) -> Job {
        let key = input_key(user, filename);
        self.store
            .put(&key, pages.join("\x0c").as_bytes())
            .await
            .unwrap();
        self.queue
            .enqueue(NewJob {
                user_id: user,
                filename: filename.into(),
                input_key: key,
            })
            .await
            .unwrap()
    }

    async fn job(&self, id: JobId) -> Job {
        self.queue.get(id).await.unwrap().unwrap()
    }

    async fn output(&self, id: JobId) -> String {
        let job = self.job(id).await;
        let key = job.output_key.expect("completed job has an output key");
        String::from_utf8(self.store.get(&key).await.unwrap()).unwrap()
    }

    async fn backdate(&self, id: JobId, by: Duration) {
        let at = chrono::Utc::now().timestamp_millis() - by.as_millis() as i64;
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(id.0)
            .execute(self.queue.pool())
            .await
            .unwrap();
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.dir.path().join("scratch"))
            .unwrap()
            .next()
            .is_none()
    }
}

/// Split an output file into page bodies (marker lines removed).
fn sections(output: &str) -> Vec<String> {
    output
        .split("--- Page ")
        .skip(1)
        .map(|s| {
            let body = s.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
            body.trim_end_matches('\n').to_string()
        })
        .collect()
}

const THREE_PAGES: [&str; 3] = [
    "The first page talks about apples.",
    "The second page talks about bananas.",
    "The third page talks about cherries.",
];

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_page_job_completes() {
    let h = Harness::new().await;
    let job = h.submit(7, "fruit.pdf", &THREE_PAGES).await;
    let translator = Arc::new(MarkingTranslator::default());

    let stats = Scheduler::new(Arc::new(h.context(translator.clone())))
        .run_until_idle()
        .await;
    assert_eq!(stats.completed, 1);

    let done = h.job(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.pages_done, 3);
    assert!(done.error.is_none());
    assert_eq!(
        done.output_key.as_deref(),
        Some(format!("outputs/7/translated_{}_fruit.txt", job.id).as_str())
    );

    let expected = format!(
        "--- Page 1 ---\n<TR:{}>\n\n--- Page 2 ---\n<TR:{}>\n\n--- Page 3 ---\n<TR:{}>\n\n",
        THREE_PAGES[0], THREE_PAGES[1], THREE_PAGES[2]
    );
    assert_eq!(h.output(job.id).await, expected);
    assert_eq!(translator.calls().len(), 3);

    assert!(matches!(
        h.store.get(&segment_key(7, job.id, 1)).await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(h.scratch_is_empty(), "scratch directory left behind");
}

#[tokio::test]
async fn resumed_job_skips_checkpointed_pages() {
    let h = Harness::new().await;
    let job = h.submit(3, "resume.pdf", &THREE_PAGES).await;

    // First attempt: page 1 is translated and checkpointed, then the worker
    // hangs on page 2 and is killed.
    let first = Arc::new(MarkingTranslator::hanging_at(1));
    let ctx = Arc::new(h.context(first.clone()));
    let claimed = h.queue.claim_next().await.unwrap().unwrap();
    let task = tokio::spawn(async move { run_job(&ctx, claimed).await });

    let mut checkpointed = false;
    for _ in 0..500 {
        if h.job(job.id).await.pages_done == 1 && first.calls().len() == 2 {
            checkpointed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(checkpointed, "first attempt never reached checkpoint 1");
    task.abort();
    let _ = task.await;
    assert!(h.store.get(&segment_key(3, job.id, 1)).await.is_ok());

    // The dead worker's job goes stale and is reclaimed.
    h.backdate(job.id, Duration::from_secs(2 * 3600)).await;
    let reclaimed = h
        .queue
        .reclaim_stale(&HashSet::new(), Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(reclaimed, vec![job.id]);
    assert_eq!(h.job(job.id).await.pages_done, 1);

    // Second attempt translates pages 2 and 3 only.
    let second = Arc::new(MarkingTranslator::default());
    let progress = Arc::new(RecordingProgress::default());
    let ctx = h.context(second.clone()).with_progress(progress.clone());
    let stats = Scheduler::new(Arc::new(ctx)).run_until_idle().await;
    assert_eq!(stats.completed, 1);

    assert_eq!(second.calls(), vec![THREE_PAGES[1].to_string(), THREE_PAGES[2].to_string()]);
    assert_eq!(*progress.starts.lock().unwrap(), vec![(job.id, 3, 1)]);
    assert_eq!(*progress.pages.lock().unwrap(), vec![2, 3]);

    let done = h.job(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.pages_done, 3);
    let bodies = sections(&h.output(job.id).await);
    assert_eq!(
        bodies,
        THREE_PAGES.iter().map(|p| format!("<TR:{p}>")).collect::<Vec<_>>()
    );
    assert_eq!(h.store.delete_prefix(&partial_prefix(3, job.id)).await.unwrap(), 0);
}

#[tokio::test]
async fn missing_segment_restarts_from_first_page() {
    let h = Harness::new().await;
    let job = h.submit(3, "gap.pdf", &THREE_PAGES).await;
    let claimed = h.queue.claim_next().await.unwrap().unwrap();
    assert!(h.queue.checkpoint(&claimed, 2).await.unwrap());
    // Only page 1's segment survived.
    h.store
        .put(&segment_key(3, job.id, 1), b"--- Page 1 ---\nold\n\n")
        .await
        .unwrap();

    let translator = Arc::new(MarkingTranslator::default());
    let claimed = h.job(job.id).await;
    run_job(&h.context(translator.clone()), claimed).await.unwrap();

    assert_eq!(translator.calls().len(), 3);
    assert!(!h.output(job.id).await.contains("old"));
}

#[tokio::test]
async fn superseded_worker_abandons_the_job() {
    let h = Harness::new().await;
    let job = h.submit(1, "twice.pdf", &["Only page."]).await;
    let stalled = h.queue.claim_next().await.unwrap().unwrap();
    h.backdate(job.id, Duration::from_secs(2 * 3600)).await;
    h.queue
        .reclaim_stale(&HashSet::new(), Duration::from_secs(3600))
        .await
        .unwrap();
    let live = h.queue.claim_next().await.unwrap().unwrap();

    // The stalled worker wakes up and finishes its copy of the job.
    let err = run_job(&h.context(Arc::new(MarkingTranslator::default())), stalled)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ClaimLost { job: id } if id == job.id));
    let row = h.job(job.id).await;
    assert_eq!(row.status, JobStatus::Processing);
    assert!(row.output_key.is_none());

    run_job(&h.context(Arc::new(MarkingTranslator::default())), live)
        .await
        .unwrap();
    assert_eq!(h.job(job.id).await.status, JobStatus::Completed);
    assert_eq!(sections(&h.output(job.id).await), vec!["<TR:Only page.>"]);
}

#[tokio::test]
async fn provider_outage_keeps_original_text() {
    let h = Harness::new().await;
    let job = h.submit(1, "outage.pdf", &["Untranslatable text here.", "Second page."]).await;
    let progress = Arc::new(RecordingProgress::default());
    let client = TranslationClient::new(Arc::new(DownBackend), &h.config());
    let ctx = h.context(Arc::new(client)).with_progress(progress.clone());

    let stats = Scheduler::new(Arc::new(ctx)).run_until_idle().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);

    let done = h.job(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(
        sections(&h.output(job.id).await),
        vec!["Untranslatable text here.", "Second page."]
    );
    assert_eq!(*progress.degraded.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn hints_never_reach_the_output() {
    let h = Harness::new().await;
    let job = h.submit(1, "echo.pdf", &THREE_PAGES).await;
    let client = TranslationClient::new(Arc::new(EchoBackend), &h.config());

    Scheduler::new(Arc::new(h.context(Arc::new(client))))
        .run_until_idle()
        .await;

    let output = h.output(job.id).await;
    for delimiter in ALL_DELIMITERS {
        assert!(!output.contains(delimiter), "delimiter {delimiter} leaked");
    }
    // Each section holds its own page and nothing from its neighbours.
    assert_eq!(sections(&output), THREE_PAGES.to_vec());
}

#[tokio::test]
async fn empty_pages_keep_their_markers() {
    let h = Harness::new().await;
    let job = h.submit(1, "blank.pdf", &["Some text on page one.", "   ", "And page three."]).await;
    let translator = Arc::new(MarkingTranslator::default());
    run_job(&h.context(translator.clone()), h.queue.claim_next().await.unwrap().unwrap())
        .await
        .unwrap();

    let output = h.output(job.id).await;
    assert!(output.contains("--- Page 2 ---\n\n--- Page 3 ---"), "{output}");
    assert_eq!(translator.calls().len(), 2);
}

#[tokio::test]
async fn missing_input_fails_the_job() {
    let h = Harness::new().await;
    let job = h
        .queue
        .enqueue(NewJob {
            user_id: 1,
            filename: "ghost.pdf".into(),
            input_key: "inputs/1/missing_ghost.pdf".into(),
        })
        .await
        .unwrap();
    let progress = Arc::new(RecordingProgress::default());
    let ctx = h
        .context(Arc::new(MarkingTranslator::default()))
        .with_progress(progress.clone());

    let stats = Scheduler::new(Arc::new(ctx)).run_until_idle().await;
    assert_eq!(stats.failed, 1);

    let failed = h.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.output_key.is_none());
    assert!(failed.error.unwrap().contains("inputs/1/missing_ghost.pdf"));
    assert_eq!(progress.failed.lock().unwrap().len(), 1);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn panicking_job_is_failed_not_fatal() {
    let h = Harness::new().await;
    let bad = h.submit(1, "bad.pdf", &["This page blows up the translator."]).await;

    let stats = Scheduler::new(Arc::new(h.context(Arc::new(PanickingTranslator))))
        .run_until_idle()
        .await;
    assert_eq!(stats.failed, 1);
    let bad = h.job(bad.id).await;
    assert_eq!(bad.status, JobStatus::Failed);
    assert!(bad.error.unwrap().contains("translator exploded"));

    // The scheduler is still usable afterwards.
    let good = h.submit(1, "good.pdf", &["Perfectly ordinary page."]).await;
    let stats = Scheduler::new(Arc::new(h.context(Arc::new(MarkingTranslator::default()))))
        .run_until_idle()
        .await;
    assert_eq!(stats.completed, 1);
    assert_eq!(h.job(good.id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn two_workers_never_share_a_job() {
    let h = Harness::new().await;
    let mut ids = Vec::new();
    for i in 0..6 {
        let pages = [format!("job {i} page one"), format!("job {i} page two")];
        let pages: Vec<&str> = pages.iter().map(String::as_str).collect();
        ids.push(h.submit(1, &format!("doc{i}.pdf"), &pages).await.id);
    }

    let t1 = Arc::new(MarkingTranslator::default());
    let t2 = Arc::new(MarkingTranslator::default());
    let w1 = Scheduler::new(Arc::new(h.context_with(h.queue.clone(), t1.clone(), h.config())));
    let w2 = Scheduler::new(Arc::new(h.context_with(
        h.second_queue().await,
        t2.clone(),
        h.config(),
    )));
    let (s1, s2) = tokio::join!(w1.run_until_idle(), w2.run_until_idle());
    assert_eq!(s1.completed + s2.completed, 6);

    let mut calls = t1.calls();
    calls.extend(t2.calls());
    let total = calls.len();
    calls.sort();
    calls.dedup();
    assert_eq!(total, 12);
    assert_eq!(calls.len(), 12, "a page was translated by both workers");
    for id in ids {
        assert_eq!(h.job(id).await.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn active_jobs_are_never_reclaimed() {
    let h = Harness::new().await;
    let job = h.submit(1, "slow.pdf", &["A page that takes forever."]).await;
    h.queue.claim_next().await.unwrap().unwrap();
    h.backdate(job.id, Duration::from_secs(10 * 3600)).await;

    let active: HashSet<JobId> = [job.id].into_iter().collect();
    let queue: Arc<dyn JobQueue> = h.queue.clone();
    assert!(queue
        .reclaim_stale(&active, Duration::from_secs(60))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.job(job.id).await.status, JobStatus::Processing);
}

#[tokio::test]
async fn scheduler_drains_on_shutdown() {
    let h = Harness::new().await;
    for i in 0..3 {
        h.submit(1, &format!("d{i}.pdf"), &["Some page of text."]).await;
    }
    let token = CancellationToken::new();
    let scheduler = Scheduler::new(Arc::new(h.context(Arc::new(MarkingTranslator::default()))));
    let running = tokio::spawn(scheduler.run(token.clone()));

    let mut drained = false;
    for _ in 0..500 {
        if h.queue.counts().await.unwrap().completed == 3 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained, "scheduler did not finish the queued jobs");

    token.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("scheduler did not stop after cancellation")
        .unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
}
