//! Download Scheduler for Feed Harvester
//!
//! This module provides a bounded download pool that:
//! 1. Runs a fixed number of workers over a shared, ordered task queue
//! 2. Spaces request starts across the whole pool with one rate limiter
//! 3. Retries transient failures with exponential backoff
//! 4. Streams into a `.part` file and renames it into place, never overwriting
//! 5. Skips ids a previous run already downloaded, when given a manifest
//! 6. Stops dispatching on cancellation and lets in-flight work finish

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::harvest::fetcher::{FetchError, FetchLimits, Fetcher};
use crate::harvest::logger::{Logger, OperationStatus};
use crate::harvest::manifest::Manifest;
use crate::harvest::naming::DestinationNamer;
use crate::harvest::rate_limiter::GlobalRateLimiter;
use crate::harvest::resource::ResourceRef;
use crate::harvest::retry::{RetryDecision, RetryPolicy};

/// Run-level errors. Per-item failures are reported as outcomes instead.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Worker failed: {0}")]
    Worker(String),
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Status of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// Download task
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub resource: ResourceRef,
    pub destination: PathBuf,
    pub attempt: u32,
    pub status: DownloadStatus,
}

/// Terminal state of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Succeeded { path: PathBuf, bytes: u64, reused: bool },
    Failed { reason: String, attempts: u32 },
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Succeeded { .. })
    }
}

/// Outcome of one resource, in discovery order
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub resource: ResourceRef,
    pub outcome: DownloadOutcome,
    /// Requests made for this resource in this run
    pub attempts: u32,
}

/// Download statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadStats {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub reused_jobs: usize,
    pub failed_jobs: usize,
    pub bytes_downloaded: u64,
}

impl DownloadStats {
    pub fn from_reports(reports: &[TaskReport]) -> Self {
        let mut stats = Self {
            total_jobs: reports.len(),
            ..Self::default()
        };
        for report in reports {
            match &report.outcome {
                DownloadOutcome::Succeeded { reused: true, .. } => stats.reused_jobs += 1,
                DownloadOutcome::Succeeded { bytes, .. } => {
                    stats.completed_jobs += 1;
                    stats.bytes_downloaded += bytes;
                }
                DownloadOutcome::Failed { .. } => stats.failed_jobs += 1,
            }
        }
        stats
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub attempt_timeout: Duration,
    pub limits: FetchLimits,
    pub show_progress: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            attempt_timeout: Duration::from_secs(30),
            limits: FetchLimits::default(),
            show_progress: false,
        }
    }
}

/// Everything a worker needs, shared across the pool
struct WorkerContext {
    config: SchedulerConfig,
    retry: RetryPolicy,
    limiter: GlobalRateLimiter,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    logger: Option<Arc<Logger>>,
    queue: Mutex<VecDeque<(usize, DownloadTask)>>,
    progress: ProgressBar,
}

pub struct DownloadScheduler {
    config: SchedulerConfig,
    retry: RetryPolicy,
    limiter: GlobalRateLimiter,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    logger: Option<Arc<Logger>>,
}

impl DownloadScheduler {
    pub fn new(
        config: SchedulerConfig,
        retry: RetryPolicy,
        limiter: GlobalRateLimiter,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            retry,
            limiter,
            fetcher,
            cancel,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn limiter(&self) -> &GlobalRateLimiter {
        &self.limiter
    }

    /// Materialize `refs` and return one report per ref, in the same order.
    ///
    /// When `manifest` is given, ids it records as downloaded are reused and
    /// every fresh outcome is written back into it.
    pub async fn run(
        &self,
        refs: &[ResourceRef],
        namer: &DestinationNamer,
        mut manifest: Option<&mut Manifest>,
    ) -> DownloadResult<Vec<TaskReport>> {
        fs::create_dir_all(namer.directory()).await?;

        let mut slots: Vec<Option<(DownloadOutcome, u32)>> = vec![None; refs.len()];
        let mut queue = VecDeque::new();
        for (index, resource) in refs.iter().enumerate() {
            if let Some((path, bytes)) = manifest.as_deref().and_then(|m| m.reusable(&resource.id)) {
                debug!("Reusing {} from a previous run", resource.id);
                if let Some(logger) = &self.logger {
                    logger.log_download(&resource.id, OperationStatus::Skipped, 0, bytes);
                }
                let reused = DownloadOutcome::Succeeded {
                    path: path.to_path_buf(),
                    bytes: bytes.unwrap_or(0),
                    reused: true,
                };
                slots[index] = Some((reused, 0));
                continue;
            }
            queue.push_back((
                index,
                DownloadTask {
                    resource: resource.clone(),
                    destination: namer.destination(index, &resource.url),
                    attempt: 0,
                    status: DownloadStatus::Pending,
                },
            ));
        }

        let pending = queue.len();
        info!(
            "Scheduling {} downloads ({} reused) with {} workers",
            pending,
            refs.len() - pending,
            self.config.concurrency
        );

        let context = Arc::new(WorkerContext {
            config: self.config.clone(),
            retry: self.retry.clone(),
            limiter: self.limiter.clone(),
            fetcher: self.fetcher.clone(),
            cancel: self.cancel.clone(),
            logger: self.logger.clone(),
            queue: Mutex::new(queue),
            progress: self.progress_bar(pending as u64),
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.config.concurrency.max(1).min(pending) {
            let context = context.clone();
            workers.spawn(async move { Self::worker_loop(worker, context).await });
        }

        while let Some(joined) = workers.join_next().await {
            let finished = joined.map_err(|e| DownloadError::Worker(e.to_string()))?;
            for (index, outcome, attempts) in finished {
                slots[index] = Some((outcome, attempts));
            }
        }

        // Whatever is still queued was never dispatched.
        for (index, task) in context.queue.lock().drain(..) {
            debug!("Not dispatching {}, run was cancelled", task.resource.id);
            let cancelled = DownloadOutcome::Failed {
                reason: FetchError::Cancelled.to_string(),
                attempts: 0,
            };
            slots[index] = Some((cancelled, 0));
        }
        context.progress.finish_and_clear();

        let reports: Vec<TaskReport> = refs
            .iter()
            .zip(slots)
            .map(|(resource, slot)| {
                let (outcome, attempts) = slot.unwrap_or_else(|| {
                    let missing = DownloadOutcome::Failed {
                        reason: "No outcome recorded".to_string(),
                        attempts: 0,
                    };
                    (missing, 0)
                });
                TaskReport {
                    resource: resource.clone(),
                    outcome,
                    attempts,
                }
            })
            .collect();

        if let Some(manifest) = manifest.as_deref_mut() {
            for report in &reports {
                match &report.outcome {
                    DownloadOutcome::Succeeded { reused: true, .. } => {}
                    DownloadOutcome::Succeeded { path, bytes, .. } => {
                        manifest.record_success(&report.resource.id, &report.resource.url, path, *bytes, report.attempts)
                    }
                    DownloadOutcome::Failed { attempts: 0, .. } => {}
                    DownloadOutcome::Failed { reason, attempts } => {
                        manifest.record_failure(&report.resource.id, &report.resource.url, reason, *attempts)
                    }
                }
            }
        }

        let stats = DownloadStats::from_reports(&reports);
        info!(
            "Downloads finished: {} completed, {} reused, {} failed, {} bytes | {}",
            stats.completed_jobs,
            stats.reused_jobs,
            stats.failed_jobs,
            stats.bytes_downloaded,
            self.limiter.get_stats().format_stats()
        );
        Ok(reports)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        const PROGRESS_TEMPLATE: &str = "{spinner} {bar:40} {pos}/{len} {msg}";
        let style = ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        let bar = ProgressBar::new(len);
        bar.set_style(style);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        bar.enable_steady_tick(Duration::from_millis(200));
        bar
    }

    async fn worker_loop(worker: usize, context: Arc<WorkerContext>) -> Vec<(usize, DownloadOutcome, u32)> {
        let mut finished = Vec::new();
        loop {
            if context.cancel.is_cancelled() {
                debug!("Worker {} stopping, run was cancelled", worker);
                break;
            }
            let Some((index, mut task)) = context.queue.lock().pop_front() else {
                break;
            };
            let outcome = Self::download(&context, &mut task).await;

            let status = match &outcome {
                DownloadOutcome::Succeeded { .. } => OperationStatus::Completed,
                DownloadOutcome::Failed { .. } if task.attempt == 0 && context.cancel.is_cancelled() => {
                    OperationStatus::Cancelled
                }
                DownloadOutcome::Failed { .. } => OperationStatus::Failed,
            };
            if let Some(logger) = &context.logger {
                let bytes = match &outcome {
                    DownloadOutcome::Succeeded { bytes, .. } => Some(*bytes),
                    DownloadOutcome::Failed { .. } => None,
                };
                logger.log_download(&task.resource.id, status, task.attempt, bytes);
            }
            context.progress.inc(1);
            finished.push((index, outcome, task.attempt));
        }
        finished
    }

    /// Drive one task to a terminal outcome.
    #[instrument(skip(context, task), fields(id = %task.resource.id))]
    async fn download(context: &WorkerContext, task: &mut DownloadTask) -> DownloadOutcome {
        let destination = task.destination.clone();
        if fs::try_exists(&destination).await.unwrap_or(false) {
            warn!("Refusing to overwrite {}", destination.display());
            task.status = DownloadStatus::Failed;
            return DownloadOutcome::Failed {
                reason: FetchError::DestinationExists(destination).to_string(),
                attempts: 0,
            };
        }
        let part = part_path(&destination);

        loop {
            tokio::select! {
                biased;
                _ = context.cancel.cancelled() => {
                    debug!("Not starting {}, run was cancelled", task.resource.id);
                    task.status = DownloadStatus::Failed;
                    return DownloadOutcome::Failed {
                        reason: FetchError::Cancelled.to_string(),
                        attempts: task.attempt,
                    };
                }
                _ = context.limiter.acquire() => {}
            }

            task.attempt += 1;
            task.status = DownloadStatus::InFlight;
            if task.attempt > 1 {
                info!("Retry attempt {}/{} for {}", task.attempt, context.retry.max_attempts, task.resource.id);
            }

            let attempt_timeout = context.config.attempt_timeout;
            let result = timeout(
                attempt_timeout,
                context
                    .fetcher
                    .fetch_to(&task.resource.url, &part, &context.config.limits),
            )
            .await
            .unwrap_or(Err(FetchError::Timeout(attempt_timeout)));

            let result = match result {
                Ok(bytes) => finalize(&part, &destination).await.map(|()| bytes),
                Err(e) => Err(e),
            };
            let error = match result {
                Ok(bytes) => {
                    task.status = DownloadStatus::Succeeded;
                    debug!("Saved {} ({} bytes)", destination.display(), bytes);
                    return DownloadOutcome::Succeeded {
                        path: destination,
                        bytes,
                        reused: false,
                    };
                }
                Err(e) => e,
            };

            discard(&part).await;
            if let FetchError::RateLimited { retry_after: Some(pause) } = &error {
                context.limiter.penalize(*pause);
            }

            match context.retry.decide(error.failure_type(), task.attempt) {
                RetryDecision::Retry { delay } => {
                    warn!("Attempt {} for {} failed: {}", task.attempt, task.resource.id, error);
                    info!("Backing off for {:?} before retry", delay);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = context.cancel.cancelled() => {
                            task.status = DownloadStatus::Failed;
                            return DownloadOutcome::Failed {
                                reason: format!("Cancelled while retrying: {}", error),
                                attempts: task.attempt,
                            };
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    error!("Failed to download {} after {} attempts: {}", task.resource.id, task.attempt, error);
                    task.status = DownloadStatus::Failed;
                    return DownloadOutcome::Failed {
                        reason: error.to_string(),
                        attempts: task.attempt,
                    };
                }
            }
        }
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Move a finished `.part` file into place unless something got there first.
async fn finalize(part: &Path, destination: &Path) -> Result<(), FetchError> {
    if fs::try_exists(destination).await? {
        return Err(FetchError::DestinationExists(destination.to_path_buf()));
    }
    fs::rename(part, destination).await?;
    Ok(())
}

async fn discard(part: &Path) {
    if let Err(e) = fs::remove_file(part).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {}: {}", part.display(), e);
        }
    }
}
