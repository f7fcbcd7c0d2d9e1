//! Page Scanner for Feed Harvester
//!
//! This module provides functionality for:
//! 1. Loading an origin feed and checking that it is accessible
//! 2. Reading candidate references out of the current view
//! 3. Scrolling between batches, one driver action at a time
//! 4. Ending the sequence on stall, on the advancement ceiling, or on cancellation
//! 5. Keeping what was already found when the browser fails part way through

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::harvest::browser::{BrowserDriver, DriverError, PageStatus, ViewCursor};
use crate::harvest::resource::{RawCandidate, ShapeFilter};

/// Consecutive empty advancements that count as the end of the feed.
pub const STALL_THRESHOLD: usize = 2;

/// Error types for scanning
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Authentication required to view {origin}")]
    AuthRequired { origin: String },

    #[error("Origin {origin} is not available")]
    OriginUnavailable { origin: String },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Result type for scanning
pub type ScanResult<T> = Result<T, ScanError>;

/// Why a scan stopped producing candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// Two advancements in a row revealed nothing new.
    Stalled,
    /// The advancement ceiling was hit.
    CeilingReached,
    Cancelled,
    /// A driver action failed after the origin had loaded.
    DriverFailed,
}

/// Scanner settings
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub max_advancements: usize,
    pub scroll_step_px: i64,
    pub navigation_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_advancements: 40,
            scroll_step_px: 768,
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

/// Lazily pulls candidates out of a scrolling feed.
///
/// The scanner only scrolls when its buffer is empty and a caller asks for
/// more, so a consumer that has what it needs simply stops calling
/// [`PageScanner::next`].
pub struct PageScanner {
    config: ScanConfig,
    filter: ShapeFilter,
    has_session: bool,
    cancel: CancellationToken,
    seen: HashSet<String>,
    buffer: VecDeque<RawCandidate>,
    empty_streak: usize,
    end: Option<ScanEnd>,
    warned_login_wall: bool,
}

impl PageScanner {
    pub fn new(config: ScanConfig, filter: ShapeFilter, has_session: bool, cancel: CancellationToken) -> Self {
        Self {
            config,
            filter,
            has_session,
            cancel,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
            empty_streak: 0,
            end: None,
            warned_login_wall: false,
        }
    }

    pub fn end(&self) -> Option<ScanEnd> {
        self.end
    }

    pub fn filter(&self) -> &ShapeFilter {
        &self.filter
    }

    /// Load the origin and read the first view. Calling it again restarts the sequence.
    pub async fn begin(&mut self, driver: &mut dyn BrowserDriver, cursor: &mut ViewCursor) -> ScanResult<()> {
        self.seen.clear();
        self.buffer.clear();
        self.empty_streak = 0;
        self.end = None;
        cursor.advancements = 0;

        if self.cancel.is_cancelled() {
            self.end = Some(ScanEnd::Cancelled);
            return Ok(());
        }

        info!("Loading origin {}", cursor.origin);
        driver.navigate(&cursor.origin, self.config.navigation_timeout).await?;
        self.settle(driver).await?;
        cursor.at_feed();
        self.check_access(driver, cursor).await?;

        let found = self.harvest(driver, cursor).await?;
        debug!("Initial view produced {} candidates", found);
        Ok(())
    }

    /// Next candidate in scan order, or `None` once the scan has ended.
    ///
    /// Only access problems are errors here. A driver failure after
    /// [`PageScanner::begin`] ends the scan with [`ScanEnd::DriverFailed`].
    pub async fn next(
        &mut self,
        driver: &mut dyn BrowserDriver,
        cursor: &mut ViewCursor,
    ) -> ScanResult<Option<RawCandidate>> {
        loop {
            if self.cancel.is_cancelled() {
                if self.end != Some(ScanEnd::Cancelled) {
                    info!("Scan cancelled with {} candidates unread", self.buffer.len());
                    self.end = Some(ScanEnd::Cancelled);
                }
                self.buffer.clear();
                return Ok(None);
            }
            if let Some(candidate) = self.buffer.pop_front() {
                return Ok(Some(candidate));
            }
            if self.end.is_some() {
                return Ok(None);
            }
            match self.advance(driver, cursor).await {
                Ok(()) => {}
                Err(ScanError::Driver(e)) => {
                    warn!("Scan ended after {} advancements, browser failed: {}", cursor.advancements, e);
                    self.end = Some(ScanEnd::DriverFailed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn advance(&mut self, driver: &mut dyn BrowserDriver, cursor: &mut ViewCursor) -> ScanResult<()> {
        if cursor.advancements >= self.config.max_advancements {
            info!("Advancement ceiling of {} reached", self.config.max_advancements);
            self.end = Some(ScanEnd::CeilingReached);
            return Ok(());
        }
        driver.scroll_by(self.config.scroll_step_px).await?;
        cursor.scrolled(self.config.scroll_step_px);
        self.settle(driver).await?;
        self.check_access(driver, cursor).await?;

        let found = self.harvest(driver, cursor).await?;
        if found == 0 {
            self.empty_streak += 1;
            debug!("Advancement {} revealed nothing new ({} in a row)", cursor.advancements, self.empty_streak);
            if self.empty_streak >= STALL_THRESHOLD {
                info!("Feed stalled after {} advancements", cursor.advancements);
                self.end = Some(ScanEnd::Stalled);
            }
        } else {
            self.empty_streak = 0;
            debug!("Advancement {} revealed {} new candidates", cursor.advancements, found);
        }
        Ok(())
    }

    /// A load that never settles is not worth failing the scan over.
    async fn settle(&self, driver: &mut dyn BrowserDriver) -> ScanResult<()> {
        match driver.wait_for_load(self.config.navigation_timeout).await {
            Ok(()) => Ok(()),
            Err(DriverError::Timeout(limit)) => {
                warn!("Page did not settle within {:?}, reading it anyway", limit);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check_access(&mut self, driver: &mut dyn BrowserDriver, cursor: &ViewCursor) -> ScanResult<()> {
        match driver.page_status().await? {
            PageStatus::Ready => Ok(()),
            PageStatus::Unavailable => Err(ScanError::OriginUnavailable {
                origin: cursor.origin.to_string(),
            }),
            PageStatus::LoginRequired if !self.has_session => Err(ScanError::AuthRequired {
                origin: cursor.origin.to_string(),
            }),
            PageStatus::LoginRequired => {
                if !self.warned_login_wall {
                    warn!("Page is asking for a login despite a saved session, continuing anyway");
                    self.warned_login_wall = true;
                }
                Ok(())
            }
        }
    }

    /// Queue every valid, unseen candidate in the current view. Returns how many were new.
    async fn harvest(&mut self, driver: &mut dyn BrowserDriver, cursor: &ViewCursor) -> ScanResult<usize> {
        let mut found = 0;
        for dom in driver.current_references().await? {
            let Some(url) = self.filter.accept(&cursor.origin, &dom.url) else {
                continue;
            };
            let cover = dom
                .cover
                .as_deref()
                .and_then(|raw| self.filter.accept_media(&cursor.origin, raw));
            let candidate = RawCandidate {
                url,
                looks_like_container: dom.looks_like_container,
                cover,
            };
            if self.seen.insert(candidate.id()) {
                self.buffer.push_back(candidate);
                found += 1;
            }
        }
        Ok(found)
    }
}
