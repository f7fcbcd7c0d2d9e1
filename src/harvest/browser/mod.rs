//! Browser driver abstraction for Feed Harvester
//!
//! Defines the `BrowserDriver` capability that discovery consumes and the
//! `ViewCursor` that tracks where the single browser surface currently is.
//! The Chromium adapter lives in [`chromium`].

pub mod chromium;
#[cfg(test)]
pub(crate) mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Error types for driver actions
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Browser error: {0}")]
    Browser(String),
}

/// Result type for driver actions
pub type DriverResult<T> = Result<T, DriverError>;

/// What the page currently shows, as far as access is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Ready,
    LoginRequired,
    Unavailable,
}

/// A reference as read straight out of the DOM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomCandidate {
    pub url: String,
    #[serde(default)]
    pub looks_like_container: bool,
    #[serde(default)]
    pub cover: Option<String>,
}

impl DomCandidate {
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            looks_like_container: false,
            cover: None,
        }
    }

    pub fn container(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            looks_like_container: true,
            cover: None,
        }
    }

    pub fn with_cover(mut self, cover: impl Into<String>) -> Self {
        self.cover = Some(cover.into());
        self
    }
}

/// A single browser surface that discovery drives one action at a time.
#[async_trait]
pub trait BrowserDriver: Send {
    /// Navigate the surface to `url`.
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> DriverResult<()>;
    /// Scroll the current view by `pixels`.
    async fn scroll_by(&mut self, pixels: i64) -> DriverResult<()>;
    /// Click the first element matching `selector`. Returns `false` if none matched.
    async fn click(&mut self, selector: &str) -> DriverResult<bool>;
    /// Candidates visible in the current view.
    async fn current_references(&mut self) -> DriverResult<Vec<DomCandidate>>;
    /// Wait until the current document settles.
    async fn wait_for_load(&mut self, timeout: Duration) -> DriverResult<()>;
    /// Return to the previous history entry.
    async fn go_back(&mut self, timeout: Duration) -> DriverResult<()>;
    /// Access state of the current page.
    async fn page_status(&mut self) -> DriverResult<PageStatus>;
    /// Serialize the surface's credentials (e.g. its cookie jar).
    async fn export_session(&mut self) -> DriverResult<serde_json::Value>;
    /// Install previously exported credentials.
    async fn import_session(&mut self, blob: &serde_json::Value) -> DriverResult<()>;
}

/// Where the browser surface is right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewLocation {
    Blank,
    Feed,
    Container(String),
}

/// Explicit model of the single-tab "current view".
///
/// Owned by the discovery run and lent to the scanner and the expander so
/// that neither has to guess where the browser is.
#[derive(Debug, Clone)]
pub struct ViewCursor {
    pub origin: Url,
    pub location: ViewLocation,
    pub scroll_offset: i64,
    pub advancements: usize,
}

impl ViewCursor {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            location: ViewLocation::Blank,
            scroll_offset: 0,
            advancements: 0,
        }
    }

    pub(crate) fn at_feed(&mut self) {
        self.location = ViewLocation::Feed;
        self.scroll_offset = 0;
    }

    pub(crate) fn scrolled(&mut self, pixels: i64) {
        self.scroll_offset += pixels;
        self.advancements += 1;
    }
}
