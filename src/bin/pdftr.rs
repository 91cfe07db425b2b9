//! CLI binary for edgequake-pdf-translate.
//!
//! Runs the translation worker and offers the small operator commands around
//! it (enqueue a PDF, inspect a job, queue counts, migrations). Flags map onto
//! `WorkerConfig`; anything not given keeps the library default.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use edgequake_pdf_translate::queue::sqlite;
use edgequake_pdf_translate::store::{input_key, safe_file_name};
use edgequake_pdf_translate::{
    ChatBackend, ChatCompletionsBackend, FsObjectStore, Job, JobId, JobQueue, JobStatus, NewJob,
    ObjectStore, PdfiumExtractor, ProviderBackend, Scheduler, SqliteJobQueue, TranslationClient,
    WorkerConfig, WorkerContext,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Create the jobs table, then run the worker until Ctrl-C
  pdftr migrate
  pdftr run --target-language German

  # Drain the queue once and exit (cron / batch use)
  pdftr run --once

  # Queue a local PDF for user 7 and follow it
  pdftr enqueue report.pdf --user 7
  pdftr status 12

  # Queue counts as JSON
  pdftr stats --json

ENVIRONMENT VARIABLES:
  DATABASE_URL            Job database, e.g. sqlite://jobs.db (postgres:// with the postgres feature)
  PDFTR_STORAGE_ROOT      Directory holding the object store buckets
  PDFTR_BUCKET            Bucket name (default: pdfs)
  PDFTR_PUBLIC_URL        Base URL the store is served from, used in presigned links
  PDFTR_SIGNING_SECRET    Secret for presigned download URLs
  OPENAI_API_KEY          API key for the chat-completions backend
  PDFTR_API_URL           Chat-completions endpoint (default: OpenAI)
  EDGEQUAKE_LLM_PROVIDER  Provider for --backend provider (openai, anthropic, gemini, ollama, ...)
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Durable, resumable PDF translation worker.
#[derive(Parser, Debug)]
#[command(
    name = "pdftr",
    version,
    about = "Durable, resumable PDF translation worker",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Job database URL.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Maximum database connections.
    #[arg(long, env = "PDFTR_DB_CONNECTIONS", global = true, default_value_t = 8)]
    db_connections: u32,

    /// Directory holding the object store buckets.
    #[arg(long, env = "PDFTR_STORAGE_ROOT", global = true)]
    storage_root: Option<PathBuf>,

    /// Object store bucket.
    #[arg(long, env = "PDFTR_BUCKET", global = true, default_value = "pdfs")]
    bucket: String,

    /// Base URL the object store is served from.
    #[arg(long, env = "PDFTR_PUBLIC_URL", global = true, default_value = "http://localhost:9000")]
    public_url: String,

    /// Secret for signing download URLs.
    #[arg(long, env = "PDFTR_SIGNING_SECRET", global = true, hide_env_values = true)]
    signing_secret: Option<String>,

    /// Log output format.
    #[arg(long, env = "PDFTR_LOG_FORMAT", global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFTR_VERBOSE", global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFTR_QUIET", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker.
    Run(Box<RunArgs>),

    /// Upload a PDF and queue it for translation.
    Enqueue {
        /// Local PDF to upload.
        pdf: PathBuf,

        /// Owner of the job.
        #[arg(long)]
        user: i64,
    },

    /// Show one job; completed jobs get a download URL.
    Status {
        id: i64,

        /// Print the job as JSON.
        #[arg(long)]
        json: bool,

        /// Lifetime of the download URL in seconds.
        #[arg(long, default_value_t = 3600)]
        url_ttl: u64,
    },

    /// Job counts per status.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Create or update the jobs table.
    Migrate,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Drain the queue once and exit instead of polling forever.
    #[arg(long)]
    once: bool,

    /// Apply migrations before starting.
    #[arg(long)]
    migrate: bool,

    /// Translation backend.
    #[arg(long, env = "PDFTR_BACKEND", value_enum, default_value = "http")]
    backend: BackendArg,

    /// Chat-completions endpoint for `--backend http`.
    #[arg(long, env = "PDFTR_API_URL", default_value = ChatCompletionsBackend::DEFAULT_URL)]
    api_url: String,

    /// API key for `--backend http`.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Provider name for `--backend provider` (auto-detected when unset).
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Model ID sent with every translation request.
    #[arg(long, env = "PDFTR_MODEL")]
    model: Option<String>,

    #[arg(long, env = "PDFTR_SOURCE_LANGUAGE")]
    source_language: Option<String>,

    #[arg(long, env = "PDFTR_TARGET_LANGUAGE")]
    target_language: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDFTR_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Jobs processed concurrently by this worker.
    #[arg(short = 'j', long, env = "PDFTR_MAX_CONCURRENT_JOBS")]
    max_concurrent_jobs: Option<usize>,

    /// Seconds between queue polls.
    #[arg(long, env = "PDFTR_POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Characters per translation request.
    #[arg(long, env = "PDFTR_MAX_CHUNK_CHARS")]
    max_chunk_chars: Option<usize>,

    /// Characters of the previous page sent as context.
    #[arg(long, env = "PDFTR_CONTEXT_CHARS")]
    context_chars: Option<usize>,

    /// Characters of the next page sent as lookahead.
    #[arg(long, env = "PDFTR_LOOKAHEAD_CHARS")]
    lookahead_chars: Option<usize>,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDFTR_TEMPERATURE")]
    temperature: Option<f32>,

    /// Retries per translation call.
    #[arg(long, env = "PDFTR_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Initial retry delay in milliseconds.
    #[arg(long, env = "PDFTR_RETRY_BACKOFF_MS")]
    retry_backoff_ms: Option<u64>,

    /// Per-call translation timeout in seconds.
    #[arg(long, env = "PDFTR_API_TIMEOUT")]
    api_timeout: Option<u64>,

    /// Per-transfer storage timeout in seconds.
    #[arg(long, env = "PDFTR_STORAGE_TIMEOUT")]
    storage_timeout: Option<u64>,

    /// Document open / batch extraction timeout in seconds.
    #[arg(long, env = "PDFTR_OPEN_TIMEOUT")]
    open_timeout: Option<u64>,

    /// Seconds after which an untouched processing job is requeued (0 disables).
    #[arg(long, env = "PDFTR_STALE_THRESHOLD")]
    stale_threshold: Option<u64>,

    /// Seconds between heartbeat / stale-reclaim sweeps.
    #[arg(long, env = "PDFTR_SWEEP_INTERVAL")]
    sweep_interval: Option<u64>,

    /// Pages extracted per document open.
    #[arg(long, env = "PDFTR_PAGE_BATCH_SIZE")]
    page_batch_size: Option<usize>,

    /// Persist progress every N pages.
    #[arg(long, env = "PDFTR_CHECKPOINT_EVERY")]
    checkpoint_every: Option<u32>,

    /// Parent directory for per-job scratch space.
    #[arg(long, env = "PDFTR_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Path to libpdfium (file or directory).
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendArg {
    /// OpenAI-compatible chat-completions endpoint over HTTP.
    Http,
    /// Any edgequake-llm provider (OpenAI, Anthropic, Gemini, Ollama, ...).
    Provider,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global);

    match cli.command {
        Command::Run(args) => run(&cli.global, *args).await,
        Command::Enqueue { pdf, user } => enqueue(&cli.global, pdf, user).await,
        Command::Status { id, json, url_ttl } => status(&cli.global, JobId(id), json, url_ttl).await,
        Command::Stats { json } => stats(&cli.global, json).await,
        Command::Migrate => {
            migrate(&cli.global).await?;
            if !cli.global.quiet {
                eprintln!("Migrations applied");
            }
            Ok(())
        }
    }
}

fn init_logging(global: &GlobalArgs) {
    let level = if global.verbose {
        "debug"
    } else if global.quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match global.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

// ── Commands ─────────────────────────────────────────────────────────────

async fn run(global: &GlobalArgs, args: RunArgs) -> Result<()> {
    // ── Startup checks ───────────────────────────────────────────────────
    let database_url = require_database_url(global)?;
    let store = open_store(global)?;

    let extractor = match &args.pdfium_lib {
        Some(path) => PdfiumExtractor::with_library_path(path),
        None => PdfiumExtractor::new(),
    };
    extractor
        .check_binding()
        .context("PDFium library not available")?;

    let config = build_config(&args).await?;
    let backend: Arc<dyn ChatBackend> = match args.backend {
        BackendArg::Http => {
            if args.api_key.is_none() && args.api_url == ChatCompletionsBackend::DEFAULT_URL {
                bail!("OPENAI_API_KEY (or --api-key) is required for the default chat-completions endpoint");
            }
            Arc::new(
                ChatCompletionsBackend::new(&args.api_url, args.api_key.clone())
                    .context("Failed to build HTTP client")?,
            )
        }
        BackendArg::Provider => Arc::new(
            ProviderBackend::resolve(args.provider.as_deref(), &config.model)
                .context("Failed to resolve LLM provider")?,
        ),
    };

    if args.migrate {
        migrate(global).await?;
    }
    let queue = open_queue(&database_url, global.db_connections).await?;

    info!(
        backend = backend.name(),
        model = %config.model,
        target = %config.target_language,
        bucket = %store.bucket(),
        "Worker starting"
    );
    let translator = TranslationClient::new(backend, &config);
    let ctx = WorkerContext::new(queue, store, Arc::new(extractor), Arc::new(translator), config);
    let scheduler = Scheduler::new(Arc::new(ctx));

    let stats = if args.once {
        scheduler.run_until_idle().await
    } else {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; finishing in-flight jobs (press again to abort)");
                signal.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            }
        });
        scheduler.run(shutdown).await
    };

    if !global.quiet {
        eprintln!(
            "{} completed, {} failed, {} abandoned, {} reclaimed",
            stats.completed, stats.failed, stats.abandoned, stats.reclaimed
        );
    }
    Ok(())
}

async fn enqueue(global: &GlobalArgs, pdf: PathBuf, user: i64) -> Result<()> {
    let database_url = require_database_url(global)?;
    let store = open_store(global)?;
    let queue = open_queue(&database_url, global.db_connections).await?;

    let filename = pdf
        .file_name()
        .map(|n| safe_file_name(&n.to_string_lossy()))
        .context("Input path has no file name")?;
    let key = input_key(user, &filename);
    store
        .upload(&pdf, &key)
        .await
        .with_context(|| format!("Failed to upload {}", pdf.display()))?;

    let job = queue
        .enqueue(NewJob {
            user_id: user,
            filename,
            input_key: key,
        })
        .await
        .context("Failed to create job")?;
    println!("{}", job.id);
    Ok(())
}

async fn status(global: &GlobalArgs, id: JobId, json: bool, url_ttl: u64) -> Result<()> {
    let database_url = require_database_url(global)?;
    let queue = open_queue(&database_url, 1).await?;
    let job = queue
        .get(id)
        .await
        .context("Failed to read job")?
        .with_context(|| format!("Job {id} not found"))?;

    let download_url = match (&job.status, &job.output_key) {
        (JobStatus::Completed, Some(key)) => {
            let store = open_store(global)?;
            if global.signing_secret.is_none() {
                bail!("PDFTR_SIGNING_SECRET is required to sign download URLs");
            }
            Some(
                store
                    .presign_get(key, Duration::from_secs(url_ttl))
                    .await
                    .context("Failed to presign download URL")?,
            )
        }
        _ => None,
    };

    if json {
        let mut value = serde_json::to_value(&job).context("Failed to serialise job")?;
        if let (Some(url), Some(obj)) = (&download_url, value.as_object_mut()) {
            obj.insert("download_url".into(), serde_json::Value::String(url.clone()));
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise job")?
        );
    } else {
        print_job(&job, download_url.as_deref());
    }
    Ok(())
}

async fn stats(global: &GlobalArgs, json: bool) -> Result<()> {
    let database_url = require_database_url(global)?;
    let queue = open_queue(&database_url, 1).await?;
    let counts = queue.counts().await.context("Failed to read queue counts")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&counts).context("Failed to serialise counts")?
        );
    } else {
        println!("queued:     {}", counts.queued);
        println!("processing: {}", counts.processing);
        println!("completed:  {}", counts.completed);
        println!("failed:     {}", counts.failed);
        println!("total:      {}", counts.total());
    }
    Ok(())
}

async fn migrate(global: &GlobalArgs) -> Result<()> {
    let database_url = require_database_url(global)?;

    #[cfg(feature = "postgres")]
    if is_postgres(&database_url) {
        use edgequake_pdf_translate::queue::postgres;
        let pool = postgres::connect_pool(&database_url, 1)
            .await
            .context("Failed to connect to PostgreSQL")?;
        return postgres::run_migrations(&pool)
            .await
            .context("Migration failed");
    }

    let pool = sqlite::connect_pool(&database_url, 1)
        .await
        .with_context(|| format!("Failed to open database {database_url}"))?;
    sqlite::run_migrations(&pool).await.context("Migration failed")
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn require_database_url(global: &GlobalArgs) -> Result<String> {
    match global.database_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(url.to_string()),
        _ => bail!("DATABASE_URL (or --database-url) is required"),
    }
}

fn open_store(global: &GlobalArgs) -> Result<Arc<dyn ObjectStore>> {
    let Some(root) = &global.storage_root else {
        bail!("PDFTR_STORAGE_ROOT (or --storage-root) is required");
    };
    if !root.is_dir() {
        bail!("Storage root {} is not a directory", root.display());
    }
    Ok(Arc::new(FsObjectStore::new(
        root,
        &global.bucket,
        &global.public_url,
        global.signing_secret.clone().unwrap_or_default(),
    )))
}

#[cfg(feature = "postgres")]
fn is_postgres(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

async fn open_queue(database_url: &str, max_connections: u32) -> Result<Arc<dyn JobQueue>> {
    #[cfg(feature = "postgres")]
    if is_postgres(database_url) {
        let queue = edgequake_pdf_translate::PgJobQueue::connect(database_url, max_connections)
            .await
            .context("Failed to open PostgreSQL job queue (run `pdftr migrate` first?)")?;
        return Ok(Arc::new(queue));
    }

    let queue = SqliteJobQueue::connect(database_url, max_connections)
        .await
        .context("Failed to open SQLite job queue (run `pdftr migrate` first?)")?;
    Ok(Arc::new(queue))
}

/// Map CLI args onto `WorkerConfig`; unset flags keep the library defaults.
async fn build_config(args: &RunArgs) -> Result<WorkerConfig> {
    let mut builder = WorkerConfig::builder();

    if let Some(path) = &args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(v) = &args.model {
        builder = builder.model(v.clone());
    }
    if let Some(v) = &args.source_language {
        builder = builder.source_language(v.clone());
    }
    if let Some(v) = &args.target_language {
        builder = builder.target_language(v.clone());
    }
    if let Some(v) = args.max_concurrent_jobs {
        builder = builder.max_concurrent_jobs(v);
    }
    if let Some(v) = args.poll_interval {
        builder = builder.poll_interval_secs(v);
    }
    if let Some(v) = args.max_chunk_chars {
        builder = builder.max_chunk_chars(v);
    }
    if let Some(v) = args.context_chars {
        builder = builder.context_chars(v);
    }
    if let Some(v) = args.lookahead_chars {
        builder = builder.lookahead_chars(v);
    }
    if let Some(v) = args.temperature {
        builder = builder.temperature(v);
    }
    if let Some(v) = args.max_retries {
        builder = builder.max_retries(v);
    }
    if let Some(v) = args.retry_backoff_ms {
        builder = builder.retry_backoff_ms(v);
    }
    if let Some(v) = args.api_timeout {
        builder = builder.api_timeout_secs(v);
    }
    if let Some(v) = args.storage_timeout {
        builder = builder.storage_timeout_secs(v);
    }
    if let Some(v) = args.open_timeout {
        builder = builder.open_timeout_secs(v);
    }
    if let Some(v) = args.stale_threshold {
        builder = builder.stale_threshold_secs(v);
    }
    if let Some(v) = args.sweep_interval {
        builder = builder.sweep_interval_secs(v);
    }
    if let Some(v) = args.page_batch_size {
        builder = builder.page_batch_size(v);
    }
    if let Some(v) = args.checkpoint_every {
        builder = builder.checkpoint_every_pages(v);
    }
    if let Some(dir) = &args.work_dir {
        builder = builder.work_dir(dir.clone());
    }

    builder.build().context("Invalid configuration")
}

fn print_job(job: &Job, download_url: Option<&str>) {
    println!("Job:        {}", job.id);
    println!("User:       {}", job.user_id);
    println!("File:       {}", job.filename);
    println!("Status:     {}", job.status);
    println!("Pages done: {}", job.pages_done);
    println!("Created:    {}", job.created_at.to_rfc3339());
    if let Some(updated) = job.updated_at {
        println!("Updated:    {}", updated.to_rfc3339());
    }
    if let Some(key) = &job.output_key {
        println!("Output:     {key}");
    }
    if let Some(url) = download_url {
        println!("Download:   {url}");
    }
    if let Some(err) = &job.error {
        println!("Error:      {err}");
    }
}
