//! Container Expander for Feed Harvester
//!
//! Opens a multi-item feed entry, walks its "next" control to enumerate every
//! member in display order, and returns the browser to the feed. A container
//! is either returned whole or not at all.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::harvest::browser::{BrowserDriver, DriverError, ViewCursor, ViewLocation};
use crate::harvest::resource::{Container, RawCandidate, ShapeFilter};

/// Error types for container expansion
#[derive(Error, Debug)]
pub enum ExpandError {
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Could not return to the feed: {0}")]
    Restore(DriverError),

    #[error("Expansion cancelled")]
    Cancelled,
}

/// Result type for container expansion
pub type ExpandResult<T> = Result<T, ExpandError>;

/// Expander settings
#[derive(Debug, Clone)]
pub struct ExpandConfig {
    pub max_next_clicks: usize,
    pub max_members: usize,
    pub next_selector: String,
    pub navigation_timeout: Duration,
}

impl Default for ExpandConfig {
    fn default() -> Self {
        Self {
            max_next_clicks: 10,
            max_members: 20,
            next_selector: r#"button[aria-label*="Next"], div[role="button"][aria-label*="Next"]"#.to_string(),
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ContainerExpander {
    config: ExpandConfig,
    filter: ShapeFilter,
    cancel: CancellationToken,
}

impl ContainerExpander {
    pub fn new(config: ExpandConfig, filter: ShapeFilter, cancel: CancellationToken) -> Self {
        Self { config, filter, cancel }
    }

    /// Enumerate the members of `candidate` and restore the feed view.
    pub async fn expand(
        &self,
        driver: &mut dyn BrowserDriver,
        cursor: &mut ViewCursor,
        candidate: &RawCandidate,
    ) -> ExpandResult<Container> {
        if self.cancel.is_cancelled() {
            return Err(ExpandError::Cancelled);
        }

        let mut container = Container::new(candidate.id(), candidate.url.clone());
        debug!("Opening container {}", container.id);

        // Nothing to undo if we never left the feed.
        driver.navigate(&candidate.url, self.config.navigation_timeout).await?;
        cursor.location = ViewLocation::Container(container.id.clone());

        let collected = self.collect(driver, &mut container).await;
        let restored = self.restore(driver, cursor).await;

        match (collected, restored) {
            (Ok(()), Ok(())) => {
                info!("Expanded container {} into {} members", container.id, container.member_refs.len());
                Ok(container.seal())
            }
            (Err(e), restored) => {
                if let Err(restore_err) = restored {
                    warn!("Also failed to return to the feed: {}", restore_err);
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
        }
    }

    async fn collect(&self, driver: &mut dyn BrowserDriver, container: &mut Container) -> ExpandResult<()> {
        self.settle(driver).await?;
        self.read_members(driver, container).await?;

        let mut clicks = 0;
        while clicks < self.config.max_next_clicks {
            if container.member_refs.len() >= self.config.max_members {
                debug!("Container {} hit the member ceiling of {}", container.id, self.config.max_members);
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(ExpandError::Cancelled);
            }
            if !driver.click(&self.config.next_selector).await? {
                break;
            }
            clicks += 1;
            self.settle(driver).await?;
            self.read_members(driver, container).await?;
        }
        if clicks == self.config.max_next_clicks {
            debug!("Container {} hit the click ceiling of {}", container.id, clicks);
        }
        Ok(())
    }

    async fn read_members(&self, driver: &mut dyn BrowserDriver, container: &mut Container) -> ExpandResult<()> {
        let base = container.url.clone();
        for dom in driver.current_references().await? {
            if container.member_refs.len() >= self.config.max_members {
                break;
            }
            if let Some(url) = self.filter.accept_media(&base, &dom.url) {
                container.push_member(&url);
            }
        }
        Ok(())
    }

    async fn settle(&self, driver: &mut dyn BrowserDriver) -> ExpandResult<()> {
        match driver.wait_for_load(self.config.navigation_timeout).await {
            Err(DriverError::Timeout(limit)) => {
                warn!("Container page did not settle within {:?}, reading it anyway", limit);
                Ok(())
            }
            other => other.map_err(ExpandError::from),
        }
    }

    /// Go back to the feed; if history fails us, reload the origin and scroll back down.
    async fn restore(&self, driver: &mut dyn BrowserDriver, cursor: &mut ViewCursor) -> ExpandResult<()> {
        let timeout = self.config.navigation_timeout;
        match driver.go_back(timeout).await {
            Ok(()) => {}
            Err(e) => {
                warn!("go_back failed ({}), reloading {}", e, cursor.origin);
                driver
                    .navigate(&cursor.origin, timeout)
                    .await
                    .map_err(ExpandError::Restore)?;
                if cursor.scroll_offset > 0 {
                    driver.scroll_by(cursor.scroll_offset).await.map_err(ExpandError::Restore)?;
                }
            }
        }
        if let Err(e) = driver.wait_for_load(timeout).await {
            debug!("Feed did not settle after returning: {}", e);
        }
        cursor.location = ViewLocation::Feed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::browser::scripted::{ScriptedContainer, ScriptedDriver};
    use crate::harvest::browser::DomCandidate;
    use crate::harvest::resource::ResourceKind;
    use url::Url;

    const ORIGIN: &str = "https://www.instagram.com/someone/";
    const POST: &str = "https://www.instagram.com/p/Carousel1/";

    fn slide(n: usize) -> Vec<String> {
        vec![format!("https://scontent.cdninstagram.com/v/c{n}.jpg")]
    }

    fn candidate() -> RawCandidate {
        RawCandidate {
            url: Url::parse(POST).unwrap(),
            looks_like_container: true,
            cover: None,
        }
    }

    async fn feed_driver(container: ScriptedContainer) -> (ScriptedDriver, ViewCursor) {
        let mut driver = ScriptedDriver::new(ORIGIN, vec![vec![DomCandidate::container(POST)]])
            .with_container(POST, container);
        let mut cursor = ViewCursor::new(Url::parse(ORIGIN).unwrap());
        driver.navigate(&cursor.origin, Duration::from_secs(1)).await.unwrap();
        cursor.at_feed();
        (driver, cursor)
    }

    fn expander(config: ExpandConfig) -> ContainerExpander {
        ContainerExpander::new(config, ShapeFilter::default(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_expansion_returns_members_in_display_order() {
        let (mut driver, mut cursor) = feed_driver(ScriptedContainer {
            slides: vec![slide(1), slide(2), slide(3)],
            ..Default::default()
        })
        .await;

        let container = expander(ExpandConfig::default())
            .expand(&mut driver, &mut cursor, &candidate())
            .await
            .unwrap();

        assert!(container.expanded);
        assert_eq!(container.id, "post-Carousel1");
        let urls: Vec<&str> = container.member_refs.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://scontent.cdninstagram.com/v/c1.jpg",
                "https://scontent.cdninstagram.com/v/c2.jpg",
                "https://scontent.cdninstagram.com/v/c3.jpg",
            ]
        );
        assert!(container.member_refs.iter().all(|m| m.kind == ResourceKind::ContainerItem));
        assert_eq!(cursor.location, ViewLocation::Feed);
        assert_eq!(driver.actions.last().map(String::as_str), Some("back"));
    }

    #[tokio::test]
    async fn test_failure_mid_expansion_yields_no_members() {
        let (mut driver, mut cursor) = feed_driver(ScriptedContainer {
            slides: vec![slide(1), slide(2), slide(3)],
            fail_on_slide: Some(2),
            ..Default::default()
        })
        .await;

        let result = expander(ExpandConfig::default())
            .expand(&mut driver, &mut cursor, &candidate())
            .await;

        assert!(matches!(result, Err(ExpandError::Driver(_))));
        assert_eq!(cursor.location, ViewLocation::Feed);
    }

    #[tokio::test]
    async fn test_cancel_between_slides_abandons_the_container() {
        let (mut driver, mut cursor) = feed_driver(ScriptedContainer {
            slides: vec![slide(1), slide(2), slide(3)],
            ..Default::default()
        })
        .await;
        let cancel = CancellationToken::new();
        // the first read after opening the container
        driver.cancel_after_reads = Some((1, cancel.clone()));

        let result = ContainerExpander::new(ExpandConfig::default(), ShapeFilter::default(), cancel)
            .expand(&mut driver, &mut cursor, &candidate())
            .await;

        assert!(matches!(result, Err(ExpandError::Cancelled)));
        assert!(!driver.actions.iter().any(|a| a.starts_with("click")));
        assert_eq!(cursor.location, ViewLocation::Feed);
    }

    #[tokio::test]
    async fn test_navigation_failure_does_not_go_back() {
        let (mut driver, mut cursor) = feed_driver(ScriptedContainer {
            slides: vec![slide(1)],
            fail_navigation: true,
            ..Default::default()
        })
        .await;

        let result = expander(ExpandConfig::default())
            .expand(&mut driver, &mut cursor, &candidate())
            .await;

        assert!(result.is_err());
        assert!(!driver.actions.iter().any(|a| a == "back"));
    }

    #[tokio::test]
    async fn test_click_ceiling_bounds_runaway_containers() {
        let slides: Vec<Vec<String>> = (0..50).map(slide).collect();
        let (mut driver, mut cursor) = feed_driver(ScriptedContainer {
            slides,
            ..Default::default()
        })
        .await;

        let container = expander(ExpandConfig {
            max_next_clicks: 4,
            ..ExpandConfig::default()
        })
        .expand(&mut driver, &mut cursor, &candidate())
        .await
        .unwrap();

        assert_eq!(container.member_refs.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_go_back_reloads_origin_and_scrolls() {
        let (mut driver, mut cursor) = feed_driver(ScriptedContainer {
            slides: vec![slide(1)],
            ..Default::default()
        })
        .await;
        driver.fail_go_back = true;
        cursor.scroll_offset = 1536;

        let container = expander(ExpandConfig::default())
            .expand(&mut driver, &mut cursor, &candidate())
            .await
            .unwrap();

        assert_eq!(container.member_refs.len(), 1);
        let reload = format!("navigate {}", ORIGIN);
        let tail: Vec<&str> = driver.actions.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, vec!["scroll 1536", reload.as_str()]);
        assert_eq!(cursor.location, ViewLocation::Feed);
    }
}
