//! Resource references for Feed Harvester
//!
//! This module provides:
//! 1. Raw candidates as read from the current browser view
//! 2. Stable resource ids derived from post codes or media URLs
//! 3. Shape validation that drops anything that is not resource-like
//! 4. The `ResourceRef` and `Container` records handed between stages

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Path of a single feed entry, e.g. `/p/CxYz123/` or `/reel/Abc/`.
static POST_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/(?:[A-Za-z0-9_.]+/)?(?:p|reel|tv)/([A-Za-z0-9_-]+)/?").expect("valid post regex")
});

const MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "heic", "mp4", "webm", "mov"];

/// Kind of a discovered resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Single,
    ContainerItem,
}

/// A candidate that passed shape validation but has not been deduplicated yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub url: Url,
    pub looks_like_container: bool,
    /// Media shown for a container in the grid, used when containers are not opened.
    pub cover: Option<Url>,
}

impl RawCandidate {
    /// Stable id of this candidate.
    pub fn id(&self) -> String {
        resource_id(&self.url)
    }
}

/// A deduplicated reference ready to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    pub url: String,
    pub kind: ResourceKind,
    pub parent_container_id: Option<String>,
    pub discovered_order: usize,
}

/// A multi-item feed entry and its members in display order.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub url: Url,
    pub member_refs: Vec<ResourceRef>,
    pub expanded: bool,
}

impl Container {
    pub(crate) fn new(id: String, url: Url) -> Self {
        Self {
            id,
            url,
            member_refs: Vec::new(),
            expanded: false,
        }
    }

    /// Append a member unless one with the same id is already present.
    /// Returns `false` when the container is sealed or the member was a repeat.
    pub(crate) fn push_member(&mut self, url: &Url) -> bool {
        if self.expanded {
            return false;
        }
        let id = resource_id(url);
        if self.member_refs.iter().any(|m| m.id == id) {
            return false;
        }
        let order = self.member_refs.len();
        self.member_refs.push(ResourceRef {
            id,
            url: url.to_string(),
            kind: ResourceKind::ContainerItem,
            parent_container_id: Some(self.id.clone()),
            discovered_order: order,
        });
        true
    }

    pub(crate) fn seal(mut self) -> Self {
        self.expanded = true;
        self
    }
}

/// Derive the stable id of a resource.
///
/// Post links are keyed by their short code. Anything else is keyed by a
/// digest of host and path so that rotating CDN query parameters still map to
/// the same id.
pub fn resource_id(url: &Url) -> String {
    if let Some(code) = post_code(url) {
        return format!("post-{}", code);
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(url.host_str().unwrap_or_default().as_bytes());
    hasher.update(url.path().as_bytes());
    let digest = hasher.finalize();
    format!("media-{}", &hex::encode(digest.as_bytes())[..16])
}

/// Short code of a post link, if `url` is one.
pub fn post_code(url: &Url) -> Option<String> {
    POST_PATH
        .captures(url.path())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Rules deciding which DOM-derived URLs are resource-like.
#[derive(Debug, Clone)]
pub struct ShapeFilter {
    skip_patterns: Vec<String>,
    media_host_fragments: Vec<String>,
}

impl ShapeFilter {
    pub fn new(skip_patterns: Vec<String>, media_host_fragments: Vec<String>) -> Self {
        Self {
            skip_patterns,
            media_host_fragments,
        }
    }

    /// Resolve `raw` against `base` and keep it only if it looks like a post
    /// link or a full-size media file.
    pub fn accept(&self, base: &Url, raw: &str) -> Option<Url> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("data:") || raw.starts_with("blob:") {
            return None;
        }
        let url = base.join(raw).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if self.skip_patterns.iter().any(|p| url.as_str().contains(p.as_str())) {
            return None;
        }
        if post_code(&url).is_some() || self.is_media(&url) {
            Some(url)
        } else {
            None
        }
    }

    /// Like [`ShapeFilter::accept`] but only media files pass.
    pub fn accept_media(&self, base: &Url, raw: &str) -> Option<Url> {
        self.accept(base, raw).filter(|url| post_code(url).is_none())
    }

    fn is_media(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default();
        if self.media_host_fragments.iter().any(|f| host.contains(f.as_str())) {
            return true;
        }
        url.path()
            .rsplit('.')
            .next()
            .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl Default for ShapeFilter {
    fn default() -> Self {
        Self::new(
            ["profile_pic", "150x150", "s150x150", "320x320", "s320x320"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ["cdninstagram", "fbcdn", "scontent"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}
