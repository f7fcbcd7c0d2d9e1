//! Destination naming for downloaded files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use url::Url;

const DEFAULT_EXTENSION: &str = "jpg";
const KNOWN_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "heic", "mp4", "webm", "mov"];

/// Names files `<collection>_<timestamp>_<index>.<ext>` under `<root>/<collection>/`.
///
/// The timestamp is fixed for the run and the index is the item's position in
/// the discovery result, so names never collide within a run.
#[derive(Debug, Clone)]
pub struct DestinationNamer {
    collection: String,
    directory: PathBuf,
    stamp: String,
}

impl DestinationNamer {
    pub fn new(root: impl AsRef<Path>, collection: &str, run_started: DateTime<Utc>) -> Self {
        let collection = sanitize_collection(collection);
        Self {
            directory: root.as_ref().join(&collection),
            collection,
            stamp: run_started.format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Directory every file of this run lands in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Destination for the item at zero-based `index`.
    pub fn destination(&self, index: usize, url: &str) -> PathBuf {
        self.directory.join(format!(
            "{}_{}_{:04}.{}",
            self.collection,
            self.stamp,
            index + 1,
            extension_of(url)
        ))
    }
}

/// Keep a collection id safe to use as a file and directory name.
pub fn sanitize_collection(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "collection".to_string()
    } else {
        cleaned
    }
}

fn extension_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path()
                .rsplit('/')
                .next()
                .and_then(|name| name.rsplit_once('.'))
                .map(|(_, ext)| ext.to_ascii_lowercase())
        })
        .filter(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}
