//! Orchestration layer for Feed Harvester
//!
//! This module wires the stages of one run together:
//! 1. Restores a saved session into the browser, or saves a fresh one
//! 2. Runs discovery against the origin with the configured ceilings
//! 3. Hands the discovered refs to the download scheduler
//! 4. Keeps the collection manifest up to date and reports run counts

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::harvest::browser::{BrowserDriver, DriverError, ViewCursor};
use crate::harvest::container_expander::{ContainerExpander, ExpandConfig};
use crate::harvest::discovery::{ContainerFailure, DiscoveryCoordinator, DiscoveryEnd, DiscoveryError};
use crate::harvest::download_scheduler::{
    DownloadError, DownloadOutcome, DownloadScheduler, DownloadStats, SchedulerConfig, TaskReport,
};
use crate::harvest::fetcher::{FetchLimits, Fetcher};
use crate::harvest::logger::Logger;
use crate::harvest::manifest::{Manifest, ManifestError};
use crate::harvest::naming::DestinationNamer;
use crate::harvest::page_scanner::{PageScanner, ScanConfig};
use crate::harvest::rate_limiter::{GlobalRateLimiter, RatePolicy};
use crate::harvest::resource::ShapeFilter;
use crate::harvest::retry::RetryPolicy;
use crate::harvest::session_store::{Session, SessionStore, SessionStoreError};
use crate::harvest::AppConfig;

/// Error types for a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Session error: {0}")]
    Session(#[from] SessionStoreError),

    #[error("Browser error: {0}")]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

impl PipelineError {
    pub fn is_auth_required(&self) -> bool {
        matches!(self, PipelineError::Discovery(DiscoveryError::AuthRequired { .. }))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// What one run should harvest
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    /// Stable collection id, used for the output directory and file names
    pub collection: String,
    pub origin: Url,
    pub count: usize,
    pub output_dir: PathBuf,
    pub use_manifest: bool,
}

/// Counts and per-item outcomes of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub collection: String,
    pub requested: usize,
    pub discovered: usize,
    pub succeeded: usize,
    pub reused: usize,
    pub failed: usize,
    pub discovery_end: DiscoveryEnd,
    pub container_failures: Vec<ContainerFailure>,
    pub items: Vec<TaskReport>,
}

impl RunReport {
    fn new(
        run_id: Uuid,
        collection: &str,
        requested: usize,
        discovery_end: DiscoveryEnd,
        container_failures: Vec<ContainerFailure>,
        items: Vec<TaskReport>,
    ) -> Self {
        let stats = DownloadStats::from_reports(&items);
        Self {
            run_id,
            collection: collection.to_string(),
            requested,
            discovered: items.len(),
            succeeded: stats.completed_jobs,
            reused: stats.reused_jobs,
            failed: stats.failed_jobs,
            discovery_end,
            container_failures,
            items,
        }
    }

    /// 0 when at least one item was saved or reused, or when nothing was asked for.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded + self.reused > 0 || self.requested == 0 {
            0
        } else {
            1
        }
    }

    /// Paths of every file this run produced or reused
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.items.iter().filter_map(|item| match &item.outcome {
            DownloadOutcome::Succeeded { path, .. } => Some(path),
            DownloadOutcome::Failed { .. } => None,
        })
    }
}

/// One harvest run over a single browser surface
pub struct Pipeline {
    config: AppConfig,
    session_store: SessionStore,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    logger: Arc<Logger>,
}

impl Pipeline {
    pub fn new(config: AppConfig, fetcher: Arc<dyn Fetcher>, cancel: CancellationToken, logger: Arc<Logger>) -> Self {
        let session_store = SessionStore::new(&config.paths.session_file);
        Self {
            config,
            session_store,
            fetcher,
            cancel,
            logger,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.session_store
    }

    /// Install the saved session into `driver`. Returns whether one was installed.
    pub async fn restore_session(&self, driver: &mut dyn BrowserDriver) -> PipelineResult<bool> {
        let Some(session) = self.session_store.load() else {
            self.logger.log_session("absent", "no fresh session on disk");
            return Ok(false);
        };
        driver.import_session(&session.credentials).await?;
        self.logger
            .log_session("restored", &format!("expires {}", session.expires_at.to_rfc3339()));
        Ok(true)
    }

    /// Persist whatever credentials `driver` currently holds.
    pub async fn save_session(&self, driver: &mut dyn BrowserDriver) -> PipelineResult<()> {
        let credentials = driver.export_session().await?;
        let validity = chrono::Duration::days(self.config.session.validity_days);
        let session = Session::new(credentials, Utc::now(), validity);
        self.session_store.save(&session)?;
        self.logger
            .log_session("saved", &format!("expires {}", session.expires_at.to_rfc3339()));
        Ok(())
    }

    /// Discover up to `request.count` resources and download them.
    pub async fn run(
        &self,
        driver: &mut dyn BrowserDriver,
        request: &HarvestRequest,
        has_session: bool,
    ) -> PipelineResult<RunReport> {
        let run_id = self.logger.run_id();
        info!(
            "Run {} harvesting up to {} items from {}",
            run_id, request.count, request.origin
        );

        let discovery = {
            let mut coordinator = self.coordinator(has_session);
            let mut cursor = ViewCursor::new(request.origin.clone());
            coordinator.run(driver, &mut cursor, request.count).await?
        };

        let namer = DestinationNamer::new(&request.output_dir, &request.collection, Utc::now());
        let mut manifest = request
            .use_manifest
            .then(|| Manifest::load(Manifest::path_in(namer.directory())));

        let items = if discovery.refs.is_empty() {
            Vec::new()
        } else {
            self.scheduler().run(&discovery.refs, &namer, manifest.as_mut()).await?
        };

        if let Some(manifest) = &manifest {
            if !items.is_empty() {
                if let Err(e) = manifest.save() {
                    warn!("Failed to save manifest: {}", e);
                }
            }
        }

        let report = RunReport::new(
            run_id,
            namer.collection(),
            request.count,
            discovery.end,
            discovery.container_failures,
            items,
        );
        self.logger.log_system_event(
            "run_finished",
            &format!(
                "discovered={} succeeded={} reused={} failed={}",
                report.discovered, report.succeeded, report.reused, report.failed
            ),
        );
        Ok(report)
    }

    fn coordinator(&self, has_session: bool) -> DiscoveryCoordinator {
        let scan = &self.config.scan;
        let filter = ShapeFilter::new(scan.skip_patterns.clone(), scan.media_host_fragments.clone());
        let scanner = PageScanner::new(
            ScanConfig {
                max_advancements: scan.max_advancements,
                scroll_step_px: scan.scroll_step_px,
                navigation_timeout: scan.navigation_timeout(),
            },
            filter.clone(),
            has_session,
            self.cancel.clone(),
        );
        let container = &self.config.container;
        let expander = ContainerExpander::new(
            ExpandConfig {
                max_next_clicks: container.max_next_clicks,
                max_members: container.max_members,
                next_selector: container.next_selector.clone(),
                navigation_timeout: scan.navigation_timeout(),
            },
            filter,
            self.cancel.clone(),
        );
        DiscoveryCoordinator::new(scanner, expander)
            .with_container_expansion(container.expand_containers)
            .with_logger(self.logger.clone())
    }

    fn scheduler(&self) -> DownloadScheduler {
        let download = &self.config.download;
        DownloadScheduler::new(
            SchedulerConfig {
                concurrency: download.concurrency.max(1),
                attempt_timeout: Duration::from_secs(download.attempt_timeout_secs),
                limits: FetchLimits {
                    max_bytes: download.max_file_bytes,
                    allowed_content_types: download.allowed_content_types.clone(),
                },
                show_progress: console::user_attended_stderr(),
            },
            RetryPolicy::new(
                download.max_attempts,
                Duration::from_millis(download.base_retry_delay_ms),
                Duration::from_millis(download.max_retry_delay_ms),
            ),
            GlobalRateLimiter::new(RatePolicy {
                min_spacing: Duration::from_millis(download.spacing_ms),
            }),
            self.fetcher.clone(),
            self.cancel.clone(),
        )
        .with_logger(self.logger.clone())
    }
}

/// Create a pipeline for this run
pub fn init_pipeline(
    config: AppConfig,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    logger: Arc<Logger>,
) -> Pipeline {
    Pipeline::new(config, fetcher, cancel, logger)
}
