//! Harvest module for Feed Harvester
//! Drives a browser over a feed, expands multi-item posts and downloads the media

pub mod browser;
pub mod cli;
pub mod config_loader;
pub mod container_expander;
pub mod discovery;
pub mod download_scheduler;
pub mod fetcher;
pub mod logger;
pub mod manifest;
pub mod naming;
pub mod orchestration;
pub mod page_scanner;
pub mod rate_limiter;
pub mod resource;
pub mod retry;
pub mod session_store;

#[cfg(test)]
mod tests;

// Re-export commonly used types for convenience
pub use config_loader::{
    AppConfig, ConfigError, ConfigManager, ConfigResult,
    init_config,
};

pub use logger::{Logger, LoggerError, LoggerResult, OperationStatus, init_logger};

// Re-export the discovery side
pub use browser::{BrowserDriver, DriverError, PageStatus, ViewCursor};
pub use discovery::{DiscoveryCoordinator, DiscoveryEnd, DiscoveryError, DiscoveryResult};
pub use resource::{Container, RawCandidate, ResourceKind, ResourceRef};
pub use session_store::{Session, SessionStore, SessionStoreError};

// Re-export the download side
pub use download_scheduler::{
    DownloadError, DownloadOutcome, DownloadResult,
    DownloadScheduler, DownloadStats, TaskReport,
};
pub use fetcher::{FetchError, Fetcher, HttpFetcher};

// Re-export orchestration and CLI functionality
pub use orchestration::{HarvestRequest, Pipeline, PipelineError, RunReport, init_pipeline};
pub use cli::{Args, run_cli};
