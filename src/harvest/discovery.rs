//! Discovery Coordinator for Feed Harvester
//!
//! This module provides functionality for:
//! 1. Pulling candidates from the page scanner in scan order
//! 2. Expanding containers and splicing their members in place, or taking
//!    their cover when expansion is off
//! 3. Deduplicating by resource id across the whole run
//! 4. Stopping at the requested count, even part way through a container

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::harvest::browser::{BrowserDriver, DriverError, ViewCursor};
use crate::harvest::container_expander::{ContainerExpander, ExpandError};
use crate::harvest::logger::{Logger, OperationStatus};
use crate::harvest::page_scanner::{PageScanner, ScanEnd, ScanError};
use crate::harvest::resource::{resource_id, RawCandidate, ResourceKind, ResourceRef};

/// Run-level discovery errors. Per-container failures are not errors.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Authentication required to view {origin}")]
    AuthRequired { origin: String },

    #[error("Origin {origin} is not available")]
    OriginUnavailable { origin: String },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

impl From<ScanError> for DiscoveryError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::AuthRequired { origin } => DiscoveryError::AuthRequired { origin },
            ScanError::OriginUnavailable { origin } => DiscoveryError::OriginUnavailable { origin },
            ScanError::Driver(e) => DiscoveryError::Driver(e),
        }
    }
}

/// Result type for discovery
pub type CoordinatorResult<T> = Result<T, DiscoveryError>;

/// Why discovery stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEnd {
    QuotaReached,
    Stalled,
    CeilingReached,
    Cancelled,
    /// The browser failed part way through; the refs found before it are kept.
    DriverFailed,
}

impl From<ScanEnd> for DiscoveryEnd {
    fn from(end: ScanEnd) -> Self {
        match end {
            ScanEnd::Stalled => DiscoveryEnd::Stalled,
            ScanEnd::CeilingReached => DiscoveryEnd::CeilingReached,
            ScanEnd::Cancelled => DiscoveryEnd::Cancelled,
            ScanEnd::DriverFailed => DiscoveryEnd::DriverFailed,
        }
    }
}

/// A container whose expansion was abandoned
#[derive(Debug, Clone)]
pub struct ContainerFailure {
    pub container_id: String,
    pub url: String,
    pub reason: String,
}

/// Ordered, deduplicated output of one discovery run
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub refs: Vec<ResourceRef>,
    pub container_failures: Vec<ContainerFailure>,
    pub end: DiscoveryEnd,
}

/// Owns the seen set and the output sequence for one run.
pub struct DiscoveryCoordinator {
    scanner: PageScanner,
    expander: ContainerExpander,
    expand_containers: bool,
    logger: Option<Arc<Logger>>,
}

impl DiscoveryCoordinator {
    /// Containers are left closed until [`DiscoveryCoordinator::with_container_expansion`] turns them on.
    pub fn new(scanner: PageScanner, expander: ContainerExpander) -> Self {
        Self {
            scanner,
            expander,
            expand_containers: false,
            logger: None,
        }
    }

    pub fn with_container_expansion(mut self, enabled: bool) -> Self {
        self.expand_containers = enabled;
        self
    }

    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Discover up to `target` distinct resources reachable from `cursor.origin`.
    pub async fn run(
        &mut self,
        driver: &mut dyn BrowserDriver,
        cursor: &mut ViewCursor,
        target: usize,
    ) -> CoordinatorResult<DiscoveryResult> {
        let origin = cursor.origin.to_string();
        let mut run = Run::new(target);

        if target == 0 {
            info!("Nothing requested for {}", origin);
            return Ok(run.finish(DiscoveryEnd::QuotaReached));
        }

        if let Some(logger) = &self.logger {
            logger.log_discovery(&origin, OperationStatus::Started, 0);
        }

        self.scanner.begin(driver, cursor).await?;

        while !run.is_full() {
            let Some(candidate) = self.scanner.next(driver, cursor).await? else {
                break;
            };
            let id = candidate.id();
            if run.seen.contains(&id) {
                continue;
            }
            if candidate.looks_like_container && self.expand_containers {
                self.splice_container(driver, cursor, &mut run, candidate, id).await;
            } else if candidate.looks_like_container {
                take_cover(&mut run, candidate, id);
            } else {
                run.seen.insert(id.clone());
                run.emit(id, candidate.url.to_string(), ResourceKind::Single, None);
            }
        }

        let end = if run.is_full() {
            DiscoveryEnd::QuotaReached
        } else {
            // The scanner only yields None once it has recorded why.
            self.scanner.end().map(DiscoveryEnd::from).unwrap_or(DiscoveryEnd::Stalled)
        };

        let result = run.finish(end);
        info!(
            "Discovery for {} ended ({:?}) with {} refs, {} failed containers",
            origin,
            result.end,
            result.refs.len(),
            result.container_failures.len()
        );
        if let Some(logger) = &self.logger {
            let status = match result.end {
                DiscoveryEnd::Cancelled => OperationStatus::Cancelled,
                DiscoveryEnd::DriverFailed => OperationStatus::Failed,
                _ => OperationStatus::Completed,
            };
            logger.log_discovery(&origin, status, result.refs.len());
        }
        Ok(result)
    }

    async fn splice_container(
        &mut self,
        driver: &mut dyn BrowserDriver,
        cursor: &mut ViewCursor,
        run: &mut Run,
        candidate: RawCandidate,
        id: String,
    ) {
        // Keyed by its own id so a re-rendered container is never reopened.
        run.seen.insert(id.clone());

        match self.expander.expand(driver, cursor, &candidate).await {
            Ok(container) => {
                if let Some(logger) = &self.logger {
                    logger.log_container(&id, OperationStatus::Completed, container.member_refs.len(), None);
                }
                for member in container.member_refs {
                    if run.is_full() {
                        debug!("Quota reached part way through container {}", id);
                        break;
                    }
                    if !run.seen.insert(member.id.clone()) {
                        continue;
                    }
                    run.emit(member.id, member.url, ResourceKind::ContainerItem, Some(id.clone()));
                }
            }
            Err(ExpandError::Cancelled) => {
                debug!("Container {} skipped, run is cancelled", id);
            }
            Err(e) => {
                let reason = e.to_string();
                match &self.logger {
                    Some(logger) => logger.log_container(&id, OperationStatus::Failed, 0, Some(&reason)),
                    None => warn!("ContainerExpandFailed for {}: {}", id, reason),
                }
                run.failures.push(ContainerFailure {
                    container_id: id,
                    url: candidate.url.to_string(),
                    reason,
                });
            }
        }
    }
}

/// Emit the grid cover of a container that is not being opened.
fn take_cover(run: &mut Run, candidate: RawCandidate, id: String) {
    run.seen.insert(id.clone());
    let Some(cover) = candidate.cover else {
        debug!("Container {} has no cover, skipped", id);
        return;
    };
    let cover_id = resource_id(&cover);
    if run.seen.insert(cover_id.clone()) {
        run.emit(cover_id, cover.to_string(), ResourceKind::Single, None);
    }
}

struct Run {
    target: usize,
    seen: HashSet<String>,
    refs: Vec<ResourceRef>,
    failures: Vec<ContainerFailure>,
}

impl Run {
    fn new(target: usize) -> Self {
        Self {
            target,
            seen: HashSet::new(),
            refs: Vec::with_capacity(target.min(1024)),
            failures: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.refs.len() >= self.target
    }

    fn emit(&mut self, id: String, url: String, kind: ResourceKind, parent: Option<String>) {
        let discovered_order = self.refs.len();
        self.refs.push(ResourceRef {
            id,
            url,
            kind,
            parent_container_id: parent,
            discovered_order,
        });
    }

    fn finish(self, end: DiscoveryEnd) -> DiscoveryResult {
        DiscoveryResult {
            refs: self.refs,
            container_failures: self.failures,
            end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::browser::scripted::{ScriptedContainer, ScriptedDriver};
    use crate::harvest::browser::{DomCandidate, PageStatus};
    use crate::harvest::container_expander::ExpandConfig;
    use crate::harvest::page_scanner::ScanConfig;
    use crate::harvest::resource::ShapeFilter;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    const ORIGIN: &str = "https://www.instagram.com/someone/";

    fn post(code: &str) -> String {
        format!("https://www.instagram.com/p/{code}/")
    }

    fn media(name: &str) -> String {
        format!("https://scontent.cdninstagram.com/v/{name}.jpg")
    }

    fn coordinator(cancel: CancellationToken) -> DiscoveryCoordinator {
        let scanner = PageScanner::new(ScanConfig::default(), ShapeFilter::default(), false, cancel.clone());
        let expander = ContainerExpander::new(ExpandConfig::default(), ShapeFilter::default(), cancel);
        DiscoveryCoordinator::new(scanner, expander).with_container_expansion(true)
    }

    async fn discover(driver: &mut ScriptedDriver, target: usize) -> DiscoveryResult {
        let mut cursor = ViewCursor::new(Url::parse(ORIGIN).unwrap());
        coordinator(CancellationToken::new())
            .run(driver, &mut cursor, target)
            .await
            .unwrap()
    }

    fn ids(result: &DiscoveryResult) -> Vec<&str> {
        result.refs.iter().map(|r| r.id.as_str()).collect()
    }

    /// 8 single posts with a 3-item carousel after the third, two per frame.
    fn feed_with_carousel() -> ScriptedDriver {
        let singles: Vec<DomCandidate> = (1..=8).map(|i| DomCandidate::single(post(&format!("S{i}")))).collect();
        let mut entries = singles[..3].to_vec();
        entries.push(DomCandidate::container(post("Carousel")));
        entries.extend_from_slice(&singles[3..]);
        let frames: Vec<Vec<DomCandidate>> = entries.chunks(2).map(|c| c.to_vec()).collect();
        ScriptedDriver::new(ORIGIN, frames).with_container(
            &post("Carousel"),
            ScriptedContainer {
                slides: vec![vec![media("c1")], vec![media("c2")], vec![media("c3")]],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_zero_target_touches_nothing() {
        let mut driver = feed_with_carousel();
        let result = discover(&mut driver, 0).await;

        assert!(result.refs.is_empty());
        assert_eq!(result.end, DiscoveryEnd::QuotaReached);
        assert!(driver.actions.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_ids_are_emitted_once() {
        let frames = vec![
            vec![DomCandidate::single(post("A")), DomCandidate::single(post("B"))],
            vec![DomCandidate::single(post("B")), DomCandidate::single(post("A"))],
            vec![DomCandidate::single(post("B")), DomCandidate::single(post("C"))],
        ];
        let mut driver = ScriptedDriver::new(ORIGIN, frames);
        let result = discover(&mut driver, 10).await;

        assert_eq!(ids(&result), vec!["post-A", "post-B", "post-C"]);
        let orders: Vec<usize> = result.refs.iter().map(|r| r.discovered_order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_identical_scripts_give_identical_order() {
        let first = discover(&mut feed_with_carousel(), 20).await;
        let second = discover(&mut feed_with_carousel(), 20).await;

        assert_eq!(first.refs, second.refs);
    }

    #[tokio::test]
    async fn test_cap_is_respected_on_a_large_source() {
        let frames: Vec<Vec<DomCandidate>> = (0..100)
            .map(|f| (0..10).map(|i| DomCandidate::single(media(&format!("{f}_{i}")))).collect())
            .collect();
        let mut driver = ScriptedDriver::new(ORIGIN, frames);
        let result = discover(&mut driver, 5).await;

        assert_eq!(result.refs.len(), 5);
        assert_eq!(result.end, DiscoveryEnd::QuotaReached);
        // everything came out of the first view
        assert_eq!(driver.scroll_count(), 0);
    }

    #[tokio::test]
    async fn test_stall_returns_partial_result() {
        let frames = vec![vec![DomCandidate::single(post("A")), DomCandidate::single(post("B"))]];
        let mut driver = ScriptedDriver::new(ORIGIN, frames);
        let result = discover(&mut driver, 50).await;

        assert_eq!(result.refs.len(), 2);
        assert_eq!(result.end, DiscoveryEnd::Stalled);
    }

    #[tokio::test]
    async fn test_failed_container_contributes_nothing() {
        let frames = vec![vec![
            DomCandidate::single(post("A")),
            DomCandidate::container(post("Broken")),
            DomCandidate::single(post("B")),
        ]];
        let mut driver = ScriptedDriver::new(ORIGIN, frames).with_container(
            &post("Broken"),
            ScriptedContainer {
                slides: vec![vec![media("x1")], vec![media("x2")], vec![media("x3")]],
                fail_on_slide: Some(2),
                ..Default::default()
            },
        );
        let result = discover(&mut driver, 10).await;

        assert_eq!(ids(&result), vec!["post-A", "post-B"]);
        assert_eq!(result.container_failures.len(), 1);
        assert_eq!(result.container_failures[0].container_id, "post-Broken");
    }

    #[tokio::test]
    async fn test_container_is_cut_at_the_quota() {
        let mut driver = feed_with_carousel();
        let result = discover(&mut driver, 6).await;

        assert_eq!(result.refs.len(), 6);
        assert_eq!(ids(&result)[..3], ["post-S1", "post-S2", "post-S3"]);
        let carousel: Vec<&ResourceRef> = result.refs[3..].iter().collect();
        assert!(carousel.iter().all(|r| r.kind == ResourceKind::ContainerItem));
        assert!(carousel.iter().all(|r| r.parent_container_id.as_deref() == Some("post-Carousel")));
        assert_eq!(carousel[0].url, media("c1"));
        assert_eq!(carousel[2].url, media("c3"));
        assert_eq!(result.end, DiscoveryEnd::QuotaReached);
    }

    #[tokio::test]
    async fn test_auth_required_is_terminal() {
        let mut driver = feed_with_carousel();
        driver.status = PageStatus::LoginRequired;
        let mut cursor = ViewCursor::new(Url::parse(ORIGIN).unwrap());

        let err = coordinator(CancellationToken::new())
            .run(&mut driver, &mut cursor, 5)
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::AuthRequired { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_what_it_has() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut driver = feed_with_carousel();
        let mut cursor = ViewCursor::new(Url::parse(ORIGIN).unwrap());

        let result = coordinator(cancel).run(&mut driver, &mut cursor, 5).await.unwrap();

        assert!(result.refs.is_empty());
        assert_eq!(result.end, DiscoveryEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_between_scrolls_keeps_earlier_refs() {
        let frames = vec![
            vec![DomCandidate::single(post("A")), DomCandidate::single(post("B"))],
            vec![DomCandidate::single(post("C")), DomCandidate::single(post("D"))],
            vec![DomCandidate::single(post("E"))],
        ];
        let mut driver = ScriptedDriver::new(ORIGIN, frames);
        let cancel = CancellationToken::new();
        driver.cancel_after_reads = Some((2, cancel.clone()));
        let mut cursor = ViewCursor::new(Url::parse(ORIGIN).unwrap());

        let result = coordinator(cancel).run(&mut driver, &mut cursor, 10).await.unwrap();

        assert_eq!(ids(&result), vec!["post-A", "post-B"]);
        assert_eq!(result.end, DiscoveryEnd::Cancelled);
        assert_eq!(driver.scroll_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_inside_a_container_drops_only_the_container() {
        let frames = vec![
            vec![DomCandidate::single(post("A")), DomCandidate::container(post("Carousel"))],
            vec![DomCandidate::single(post("B"))],
        ];
        let mut driver = ScriptedDriver::new(ORIGIN, frames).with_container(
            &post("Carousel"),
            ScriptedContainer {
                slides: vec![vec![media("c1")], vec![media("c2")], vec![media("c3")]],
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        // the first slide is the second view read
        driver.cancel_after_reads = Some((2, cancel.clone()));
        let mut cursor = ViewCursor::new(Url::parse(ORIGIN).unwrap());

        let result = coordinator(cancel).run(&mut driver, &mut cursor, 10).await.unwrap();

        assert_eq!(ids(&result), vec!["post-A"]);
        assert!(result.container_failures.is_empty());
        assert_eq!(result.end, DiscoveryEnd::Cancelled);
        assert!(!driver.actions.iter().any(|a| a.starts_with("click")));
        assert_eq!(driver.scroll_count(), 0);
    }

    #[tokio::test]
    async fn test_browser_failure_mid_scan_returns_partial_result() {
        let frames = vec![
            vec![DomCandidate::single(post("A")), DomCandidate::single(post("B"))],
            vec![DomCandidate::single(post("C"))],
            vec![DomCandidate::single(post("D"))],
        ];
        let mut driver = ScriptedDriver::new(ORIGIN, frames);
        driver.fail_on_scroll = Some(2);

        let result = discover(&mut driver, 10).await;

        assert_eq!(ids(&result), vec!["post-A", "post-B", "post-C"]);
        assert_eq!(result.end, DiscoveryEnd::DriverFailed);
    }

    fn feed_with_covered_carousel() -> ScriptedDriver {
        let frames = vec![vec![
            DomCandidate::single(post("A")),
            DomCandidate::container(post("Carousel")).with_cover(media("cover")),
            DomCandidate::container(post("Bare")),
            DomCandidate::single(post("B")),
        ]];
        ScriptedDriver::new(ORIGIN, frames).with_container(
            &post("Carousel"),
            ScriptedContainer {
                slides: vec![vec![media("c1")], vec![media("c2")]],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_closed_containers_contribute_their_cover() {
        let mut driver = feed_with_covered_carousel();
        let scanner = PageScanner::new(ScanConfig::default(), ShapeFilter::default(), false, CancellationToken::new());
        let expander = ContainerExpander::new(ExpandConfig::default(), ShapeFilter::default(), CancellationToken::new());
        let mut cursor = ViewCursor::new(Url::parse(ORIGIN).unwrap());

        let result = DiscoveryCoordinator::new(scanner, expander)
            .run(&mut driver, &mut cursor, 10)
            .await
            .unwrap();

        let urls: Vec<&str> = result.refs.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec![post("A"), media("cover"), post("B")]);
        assert!(result.refs.iter().all(|r| r.kind == ResourceKind::Single));
        assert!(!driver.actions.iter().any(|a| a.contains("/p/Carousel/")));
        assert!(result.container_failures.is_empty());
    }

    #[tokio::test]
    async fn test_open_containers_contribute_their_members() {
        let mut driver = feed_with_covered_carousel();
        let result = discover(&mut driver, 10).await;

        let urls: Vec<&str> = result.refs.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec![post("A"), media("c1"), media("c2"), post("B")]);
        assert_eq!(result.container_failures.len(), 0);
    }
}
