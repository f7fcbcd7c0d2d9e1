//! Structured Logging for Feed Harvester
//!
//! This module provides functionality for:
//! 1. Logging every discovery step, container expansion, and download
//! 2. Including run ID, resource ID, status, and timestamp
//! 3. Writing logs to the terminal and to a daily rotating file in JSON or line format

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};
use uuid::Uuid;

use crate::harvest::AppConfig;

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Discovery,
    Container,
    Download,
    Session,
    System,
}

impl std::fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEntryType::Discovery => write!(f, "discovery"),
            LogEntryType::Container => write!(f, "container"),
            LogEntryType::Download => write!(f, "download"),
            LogEntryType::Session => write!(f, "session"),
            LogEntryType::System => write!(f, "system"),
        }
    }
}

/// Status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Started,
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Started => write!(f, "started"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Skipped => write!(f, "skipped"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Logger for structured logging, tagged with the run it belongs to
pub struct Logger {
    run_id: Uuid,
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Install the global subscriber described by `config`.
    pub fn new(config: &AppConfig) -> LoggerResult<Self> {
        let log_dir = if config.logging.log_to_file {
            let dir = PathBuf::from(&config.paths.log_directory);
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
            }
            Some(dir)
        } else {
            None
        };

        let guard = Self::init_logger(
            log_dir.as_deref(),
            &config.logging.log_format,
            &config.logging.log_level,
        )?;

        Ok(Self {
            run_id: Uuid::new_v4(),
            _guard: guard,
        })
    }

    /// A logger that only tags events; used when a subscriber is already installed.
    pub fn detached() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            _guard: None,
        }
    }

    /// Initialize the subscriber with a terminal layer and an optional rolling file layer
    fn init_logger(log_dir: Option<&Path>, format: &str, level: &str) -> LoggerResult<Option<WorkerGuard>> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        let terminal = fmt::layer()
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr);

        let (file_layer, guard) = match log_dir {
            Some(dir) => {
                let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "feed_harvester.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let layer = match format {
                    "json" => fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .with_span_events(FmtSpan::CLOSE)
                        .boxed(),
                    _ => fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking)
                        .with_span_events(FmtSpan::CLOSE)
                        .boxed(),
                };
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(terminal)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(log_format = format, log_level = level, "Logger initialized");

        Ok(guard)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Log a discovery milestone for an origin
    pub fn log_discovery(&self, origin: &str, status: OperationStatus, discovered: usize) {
        info!(
            entry_type = %LogEntryType::Discovery,
            run_id = %self.run_id,
            origin = origin,
            status = %status,
            discovered = discovered,
            timestamp = %Utc::now().to_rfc3339(),
            "Discovery {} for {}", status, origin
        );
    }

    /// Log a container expansion result
    pub fn log_container(&self, container_id: &str, status: OperationStatus, members: usize, reason: Option<&str>) {
        if status == OperationStatus::Failed {
            warn!(
                entry_type = %LogEntryType::Container,
                run_id = %self.run_id,
                container_id = container_id,
                status = %status,
                reason = reason,
                timestamp = %Utc::now().to_rfc3339(),
                "ContainerExpandFailed for {}", container_id
            );
        } else {
            info!(
                entry_type = %LogEntryType::Container,
                run_id = %self.run_id,
                container_id = container_id,
                status = %status,
                members = members,
                timestamp = %Utc::now().to_rfc3339(),
                "Container {} {} with {} members", container_id, status, members
            );
        }
    }

    /// Log a download outcome
    pub fn log_download(&self, resource_id: &str, status: OperationStatus, attempts: u32, bytes: Option<u64>) {
        info!(
            entry_type = %LogEntryType::Download,
            run_id = %self.run_id,
            resource_id = resource_id,
            status = %status,
            attempts = attempts,
            bytes = bytes,
            timestamp = %Utc::now().to_rfc3339(),
            "Download {} for {}", status, resource_id
        );
    }

    /// Log a session event
    pub fn log_session(&self, event: &str, details: &str) {
        info!(
            entry_type = %LogEntryType::Session,
            run_id = %self.run_id,
            event = event,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            "Session {}", event
        );
    }

    /// Log a system event
    pub fn log_system_event(&self, event_type: &str, details: &str) {
        info!(
            entry_type = %LogEntryType::System,
            run_id = %self.run_id,
            event_type = event_type,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            "System event: {}", event_type
        );
    }

    /// Log a run-level error
    pub fn log_error(&self, error_type: &str, message: &str) {
        error!(
            entry_type = "error",
            run_id = %self.run_id,
            error_type = error_type,
            timestamp = %Utc::now().to_rfc3339(),
            "Error: {}", message
        );
    }
}

/// Create the logger for this run
pub fn init_logger(config: &AppConfig) -> LoggerResult<Logger> {
    Logger::new(config)
}
