//! Bounded-concurrency job executor.
//!
//! One scheduler per worker process. It keeps at most
//! `max_concurrent_jobs` jobs in flight, each in its own task, and runs
//! three timers next to them:
//!
//! * **poll**: look for queued work when slots are free, and report queue
//!   counts while idle (at most once per `idle_report_interval`).
//! * **sweep**: heartbeat the jobs in flight, then requeue `processing` jobs
//!   that went stale in *other* processes.
//! * **shutdown**: stop claiming, let in-flight jobs finish, return.
//!
//! A job task that panics is caught and turned into a failed job; it never
//! takes the scheduler down.

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::job::JobId;
use crate::pipeline::extract::TextExtractor;
use crate::pipeline::translate::Translate;
use crate::process::{record_failure, run_job, JobReport};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::queue::JobQueue;
use crate::store::ObjectStore;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a job needs, shared by all job tasks.
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn ObjectStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub translator: Arc<dyn Translate>,
    pub config: Arc<WorkerConfig>,
    pub progress: ProgressCallback,
}

impl WorkerContext {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        translator: Arc<dyn Translate>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            extractor,
            translator,
            config: Arc::new(config),
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }
}

/// What one scheduler run did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub completed: usize,
    pub failed: usize,
    /// Jobs dropped because another worker took them over.
    pub abandoned: usize,
    /// Stale jobs this scheduler put back in the queue.
    pub reclaimed: usize,
}

type TaskOutput = (JobId, Result<JobReport, WorkerError>);

pub struct Scheduler {
    ctx: Arc<WorkerContext>,
    tasks: JoinSet<TaskOutput>,
    active: HashMap<task::Id, JobId>,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            tasks: JoinSet::new(),
            active: HashMap::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// Run until `shutdown` is cancelled and in-flight jobs have drained.
    pub async fn run(mut self, shutdown: CancellationToken) -> SchedulerStats {
        let cfg = Arc::clone(&self.ctx.config);
        info!(
            max_concurrent_jobs = cfg.max_concurrent_jobs,
            poll_secs = cfg.poll_interval_secs,
            stale_secs = cfg.stale_threshold_secs,
            "Scheduler started"
        );

        let mut poll = interval(cfg.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately: orphans from a previous crash are
        // requeued at startup.
        let mut sweep = interval(cfg.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_report: Option<Instant> = None;
        let mut draining = false;

        loop {
            if !draining {
                self.fill_slots().await;
            } else if self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled(), if !draining => {
                    info!(in_flight = self.active.len(), "Shutdown requested; draining in-flight jobs");
                    draining = true;
                }
                Some(joined) = self.tasks.join_next_with_id() => self.on_joined(joined),
                _ = poll.tick(), if !draining => {
                    if self.active.is_empty() {
                        self.report_idle(&mut last_report).await;
                    }
                }
                _ = sweep.tick() => self.sweep().await,
            }
        }

        info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            abandoned = self.stats.abandoned,
            reclaimed = self.stats.reclaimed,
            "Scheduler stopped"
        );
        self.stats
    }

    /// Process queued jobs until the queue is empty and nothing is in
    /// flight, then return.
    pub async fn run_until_idle(mut self) -> SchedulerStats {
        self.sweep().await;
        let period = self.ctx.config.sweep_interval();
        let mut sweep = interval_at(tokio::time::Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.fill_slots().await;
            if self.tasks.is_empty() {
                break;
            }
            tokio::select! {
                Some(joined) = self.tasks.join_next_with_id() => self.on_joined(joined),
                _ = sweep.tick() => self.sweep().await,
            }
        }
        debug!(stats = ?self.stats, "Queue drained");
        self.stats
    }

    /// Claim jobs until every slot is busy or the queue is empty.
    async fn fill_slots(&mut self) {
        while self.active.len() < self.ctx.config.max_concurrent_jobs {
            match self.ctx.queue.claim_next().await {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    let ctx = Arc::clone(&self.ctx);
                    let handle = self.tasks.spawn(async move {
                        let outcome = match AssertUnwindSafe(run_job(&ctx, job.clone()))
                            .catch_unwind()
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(panic) => {
                                let err = WorkerError::Internal(format!(
                                    "job task panicked: {}",
                                    panic_message(panic.as_ref())
                                ));
                                error!(job = %job.id, "{err}");
                                record_failure(&ctx, &job, &err.to_string()).await;
                                Err(err)
                            }
                        };
                        (job.id, outcome)
                    });
                    self.active.insert(handle.id(), job_id);
                    debug!(job = %job_id, in_flight = self.active.len(), "Job dispatched");
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to claim a job");
                    break;
                }
            }
        }
    }

    fn on_joined(&mut self, joined: Result<(task::Id, TaskOutput), JoinError>) {
        match joined {
            Ok((task_id, (job, outcome))) => {
                self.active.remove(&task_id);
                match outcome {
                    Ok(_) => self.stats.completed += 1,
                    Err(WorkerError::ClaimLost { .. }) => self.stats.abandoned += 1,
                    Err(_) => self.stats.failed += 1,
                }
                debug!(job = %job, in_flight = self.active.len(), "Job task finished");
            }
            Err(join_err) => {
                let job = self.active.remove(&join_err.id());
                // Panics are caught inside the task, so this is a cancelled
                // task; its row stays `processing` until reclaimed.
                error!(job = ?job, error = %join_err, "Job task did not finish");
                self.stats.abandoned += 1;
            }
        }
    }

    /// Heartbeat in-flight jobs, then requeue stale ones held elsewhere.
    async fn sweep(&mut self) {
        let ids: Vec<JobId> = self.active.values().copied().collect();
        if !ids.is_empty() {
            match self.ctx.queue.heartbeat(&ids).await {
                Ok(n) => debug!(touched = n, "Heartbeat"),
                Err(e) => warn!(error = %e, "Heartbeat failed"),
            }
        }

        let cfg = &self.ctx.config;
        if cfg.stale_threshold_secs == 0 {
            return;
        }
        let exclude: HashSet<JobId> = ids.into_iter().collect();
        match self
            .ctx
            .queue
            .reclaim_stale(&exclude, cfg.stale_threshold())
            .await
        {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(jobs = ?reclaimed, "Reclaimed stale jobs");
                self.stats.reclaimed += reclaimed.len();
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Stale job reclaim failed"),
        }
    }

    async fn report_idle(&mut self, last_report: &mut Option<Instant>) {
        let due = last_report
            .map(|at| at.elapsed() >= self.ctx.config.idle_report_interval())
            .unwrap_or(true);
        if !due {
            return;
        }
        *last_report = Some(Instant::now());
        match self.ctx.queue.counts().await {
            Ok(counts) => info!(%counts, "Idle; waiting for jobs"),
            Err(e) => warn!(error = %e, "Could not read queue counts"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
