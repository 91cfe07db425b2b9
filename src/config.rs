//! Configuration for the translation worker.
//!
//! Every knob lives in [`WorkerConfig`], built via [`WorkerConfigBuilder`].
//! One struct is shared (behind an `Arc`) by the scheduler, every in-flight
//! job and the translation client, so two workers with the same config make
//! the same decisions.
//!
//! Defaults follow the production worker this crate replaces: 5 s polling,
//! 12 000-character chunks, 90 s per translation call, jobs untouched for an
//! hour are presumed orphaned.

use crate::error::WorkerError;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the job scheduler and per-job pipeline.
///
/// Built via [`WorkerConfig::builder()`] or using [`WorkerConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf_translate::WorkerConfig;
///
/// let config = WorkerConfig::builder()
///     .max_concurrent_jobs(8)
///     .max_chunk_chars(6_000)
///     .target_language("German")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_jobs, 8);
/// ```
#[derive(Clone)]
pub struct WorkerConfig {
    // ── Scheduling ────────────────────────────────────────────────────────
    /// How often the scheduler looks for queued jobs when it has free slots. Default: 5 s.
    pub poll_interval_secs: u64,

    /// Upper bound on jobs in flight in this process. Default: 4.
    ///
    /// Each job spends nearly all its time waiting on the translation API,
    /// so this is a budget for concurrent outbound requests rather than CPU.
    pub max_concurrent_jobs: usize,

    /// A `processing` job untouched for this long is returned to the queue. Default: 3600 s.
    ///
    /// `0` turns stale reclaim off for this worker. Otherwise it must be at
    /// least twice `sweep_interval_secs`, so a live job always gets a
    /// heartbeat in before another worker's sweep can call it stale.
    pub stale_threshold_secs: u64,

    /// Period of the heartbeat + stale-reclaim sweep. Default: 60 s.
    pub sweep_interval_secs: u64,

    /// Minimum spacing of the idle queue-count report. Default: 60 s.
    pub idle_report_interval_secs: u64,

    // ── Extraction ────────────────────────────────────────────────────────
    /// Pages extracted per document open. Default: 20.
    ///
    /// The document is re-opened for each batch so a very long PDF never
    /// keeps more than one batch of parsed pages alive.
    pub page_batch_size: usize,

    /// Deadline for opening the document or extracting one batch. Default: 120 s.
    pub open_timeout_secs: u64,

    // ── Chunking and context ──────────────────────────────────────────────
    /// Upper bound on characters per translation call. Default: 12 000.
    ///
    /// A single line longer than this is still sent whole.
    pub max_chunk_chars: usize,

    /// Characters of the previous page sent as context with a page's first chunk. Default: 400.
    pub context_chars: usize,

    /// Characters of the next page sent as lookahead with a page's last chunk. Default: 200.
    pub lookahead_chars: usize,

    /// Chunks with fewer non-whitespace-trimmed characters are passed through
    /// without an API call (page numbers, stray symbols). Default: 5.
    pub min_translatable_chars: usize,

    // ── Translation ───────────────────────────────────────────────────────
    /// Model identifier sent with every request. Default: `gpt-4o-mini`.
    pub model: String,

    /// Sampling temperature. Default: 0.3.
    pub temperature: f32,

    /// Retries after the first failed attempt of one translation call. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 1500.
    pub retry_backoff_ms: u64,

    /// Per-attempt deadline for a translation call. Default: 90 s.
    ///
    /// A timeout counts as a failed attempt; it never aborts the job.
    pub api_timeout_secs: u64,

    /// Language of the uploaded documents. Default: English.
    pub source_language: String,

    /// Language to translate into. Default: Russian.
    pub target_language: String,

    /// Custom system prompt. If None, one is built from the languages.
    pub system_prompt: Option<String>,

    // ── Checkpoints and storage ───────────────────────────────────────────
    /// Persist the progress counter every this many pages. Default: 1.
    pub checkpoint_every_pages: u32,

    /// Deadline for one object-store transfer. Default: 300 s.
    pub storage_timeout_secs: u64,

    /// Parent directory for per-job scratch directories. Default: OS temp dir.
    pub work_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_concurrent_jobs: 4,
            stale_threshold_secs: 60 * 60,
            sweep_interval_secs: 60,
            idle_report_interval_secs: 60,
            page_batch_size: 20,
            open_timeout_secs: 120,
            max_chunk_chars: 12_000,
            context_chars: 400,
            lookahead_chars: 200,
            min_translatable_chars: 5,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_retries: 3,
            retry_backoff_ms: 1500,
            api_timeout_secs: 90,
            source_language: "English".to_string(),
            target_language: "Russian".to_string(),
            system_prompt: None,
            checkpoint_every_pages: 1,
            storage_timeout_secs: 300,
            work_dir: None,
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("stale_threshold_secs", &self.stale_threshold_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("page_batch_size", &self.page_batch_size)
            .field("max_chunk_chars", &self.max_chunk_chars)
            .field("context_chars", &self.context_chars)
            .field("lookahead_chars", &self.lookahead_chars)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field(
                "languages",
                &format_args!("{} -> {}", self.source_language, self.target_language),
            )
            .field("system_prompt", &self.system_prompt.as_ref().map(|_| "<custom>"))
            .field("checkpoint_every_pages", &self.checkpoint_every_pages)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl WorkerConfig {
    /// Create a new builder for `WorkerConfig`.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_report_interval(&self) -> Duration {
        Duration::from_secs(self.idle_report_interval_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    /// Directory under which per-job scratch directories are created.
    pub fn scratch_root(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Builder for [`WorkerConfig`].
#[derive(Debug)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.poll_interval_secs = secs.max(1);
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    pub fn stale_threshold_secs(mut self, secs: u64) -> Self {
        self.config.stale_threshold_secs = secs;
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.sweep_interval_secs = secs.max(1);
        self
    }

    pub fn idle_report_interval_secs(mut self, secs: u64) -> Self {
        self.config.idle_report_interval_secs = secs.max(1);
        self
    }

    pub fn page_batch_size(mut self, n: usize) -> Self {
        self.config.page_batch_size = n.max(1);
        self
    }

    pub fn open_timeout_secs(mut self, secs: u64) -> Self {
        self.config.open_timeout_secs = secs;
        self
    }

    pub fn max_chunk_chars(mut self, n: usize) -> Self {
        self.config.max_chunk_chars = n;
        self
    }

    pub fn context_chars(mut self, n: usize) -> Self {
        self.config.context_chars = n;
        self
    }

    pub fn lookahead_chars(mut self, n: usize) -> Self {
        self.config.lookahead_chars = n;
        self
    }

    pub fn min_translatable_chars(mut self, n: usize) -> Self {
        self.config.min_translatable_chars = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn source_language(mut self, lang: impl Into<String>) -> Self {
        self.config.source_language = lang.into();
        self
    }

    pub fn target_language(mut self, lang: impl Into<String>) -> Self {
        self.config.target_language = lang.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn checkpoint_every_pages(mut self, n: u32) -> Self {
        self.config.checkpoint_every_pages = n.max(1);
        self
    }

    pub fn storage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.storage_timeout_secs = secs;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WorkerConfig, WorkerError> {
        let c = &self.config;
        if c.max_chunk_chars == 0 {
            return Err(WorkerError::InvalidConfig(
                "max_chunk_chars must be at least 1".into(),
            ));
        }
        if c.model.trim().is_empty() {
            return Err(WorkerError::InvalidConfig("model must not be empty".into()));
        }
        if c.target_language.trim().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "target_language must not be empty".into(),
            ));
        }
        for (name, secs) in [
            ("api_timeout_secs", c.api_timeout_secs),
            ("open_timeout_secs", c.open_timeout_secs),
            ("storage_timeout_secs", c.storage_timeout_secs),
        ] {
            if secs == 0 {
                return Err(WorkerError::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if c.stale_threshold_secs != 0
            && c.stale_threshold_secs < c.sweep_interval_secs.saturating_mul(2)
        {
            return Err(WorkerError::InvalidConfig(format!(
                "stale_threshold_secs ({}) must be at least twice sweep_interval_secs ({}): \
                 heartbeats would not keep live jobs fresh",
                c.stale_threshold_secs, c.sweep_interval_secs
            )));
        }
        Ok(self.config)
    }
}
