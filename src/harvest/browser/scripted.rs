//! Scripted browser used by the discovery tests.
//!
//! The feed is a list of frames: frame `i` is what the view shows after `i`
//! scrolls, and scrolling past the last frame keeps showing it. Containers are
//! keyed by URL and hold one slide per "next" click.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{BrowserDriver, DomCandidate, DriverError, DriverResult, PageStatus};

#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedContainer {
    pub slides: Vec<Vec<String>>,
    /// Fail the click that would reveal this slide index.
    pub fail_on_slide: Option<usize>,
    pub fail_navigation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Place {
    Blank,
    Feed,
    Container { url: String, slide: usize },
    Elsewhere,
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptedDriver {
    origin: String,
    frames: Vec<Vec<DomCandidate>>,
    containers: HashMap<String, ScriptedContainer>,
    place: Place,
    frame: usize,
    history: Vec<(Place, usize)>,
    pub status: PageStatus,
    pub fail_go_back: bool,
    /// Fail the scroll with this 1-based number.
    pub fail_on_scroll: Option<usize>,
    /// Every read of the current view fails.
    pub fail_reads: bool,
    /// Cancel the token once this many views have been read.
    pub cancel_after_reads: Option<(usize, CancellationToken)>,
    pub session: Option<serde_json::Value>,
    pub actions: Vec<String>,
}

impl ScriptedDriver {
    pub fn new(origin: &str, frames: Vec<Vec<DomCandidate>>) -> Self {
        Self {
            origin: origin.to_string(),
            frames,
            containers: HashMap::new(),
            place: Place::Blank,
            frame: 0,
            history: Vec::new(),
            status: PageStatus::Ready,
            fail_go_back: false,
            fail_on_scroll: None,
            fail_reads: false,
            cancel_after_reads: None,
            session: None,
            actions: Vec::new(),
        }
    }

    pub fn with_container(mut self, url: &str, container: ScriptedContainer) -> Self {
        self.containers.insert(url.to_string(), container);
        self
    }

    pub fn scroll_count(&self) -> usize {
        self.actions.iter().filter(|a| a.starts_with("scroll")).count()
    }

    fn visible_frame(&self) -> Vec<DomCandidate> {
        if self.frames.is_empty() {
            return Vec::new();
        }
        let idx = self.frame.min(self.frames.len() - 1);
        self.frames[idx].clone()
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn navigate(&mut self, url: &Url, _timeout: Duration) -> DriverResult<()> {
        self.actions.push(format!("navigate {}", url));
        let target = url.to_string();
        let previous = (self.place.clone(), self.frame);
        if target == self.origin {
            self.history.push(previous);
            self.place = Place::Feed;
            self.frame = 0;
            return Ok(());
        }
        if let Some(container) = self.containers.get(&target) {
            if container.fail_navigation {
                return Err(DriverError::Navigation {
                    url: target,
                    reason: "scripted failure".to_string(),
                });
            }
            self.history.push(previous);
            self.place = Place::Container { url: target, slide: 0 };
            return Ok(());
        }
        self.history.push(previous);
        self.place = Place::Elsewhere;
        Ok(())
    }

    async fn scroll_by(&mut self, pixels: i64) -> DriverResult<()> {
        self.actions.push(format!("scroll {}", pixels));
        if self.fail_on_scroll == Some(self.scroll_count()) {
            return Err(DriverError::Script("scripted scroll failure".to_string()));
        }
        if self.place == Place::Feed {
            self.frame += 1;
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> DriverResult<bool> {
        self.actions.push(format!("click {}", selector));
        let Place::Container { url, slide } = self.place.clone() else {
            return Ok(false);
        };
        let script = &self.containers[&url];
        let next = slide + 1;
        if script.fail_on_slide == Some(next) {
            return Err(DriverError::Script("scripted click failure".to_string()));
        }
        if next < script.slides.len() {
            self.place = Place::Container { url, slide: next };
            return Ok(true);
        }
        Ok(false)
    }

    async fn current_references(&mut self) -> DriverResult<Vec<DomCandidate>> {
        self.actions.push("read".to_string());
        if self.fail_reads {
            return Err(DriverError::Script("scripted read failure".to_string()));
        }
        let reads = self.actions.iter().filter(|a| a.as_str() == "read").count();
        if let Some((after, token)) = &self.cancel_after_reads {
            if reads == *after {
                token.cancel();
            }
        }
        Ok(match &self.place {
            Place::Feed => self.visible_frame(),
            Place::Container { url, slide } => self.containers[url].slides[*slide]
                .iter()
                .map(DomCandidate::single)
                .collect(),
            Place::Blank | Place::Elsewhere => Vec::new(),
        })
    }

    async fn wait_for_load(&mut self, _timeout: Duration) -> DriverResult<()> {
        Ok(())
    }

    async fn go_back(&mut self, _timeout: Duration) -> DriverResult<()> {
        self.actions.push("back".to_string());
        if self.fail_go_back {
            return Err(DriverError::Browser("scripted go_back failure".to_string()));
        }
        if let Some((place, frame)) = self.history.pop() {
            self.place = place;
            self.frame = frame;
        }
        Ok(())
    }

    async fn page_status(&mut self) -> DriverResult<PageStatus> {
        Ok(self.status)
    }

    async fn export_session(&mut self) -> DriverResult<serde_json::Value> {
        Ok(self.session.clone().unwrap_or(serde_json::Value::Null))
    }

    async fn import_session(&mut self, blob: &serde_json::Value) -> DriverResult<()> {
        self.session = Some(blob.clone());
        Ok(())
    }
}
