//! Download manifest for Feed Harvester
//!
//! This module provides functionality for:
//! 1. Recording the terminal status of every resource id in a collection
//! 2. Letting a re-run skip ids that already have a file on disk
//! 3. Atomic saves, with an unreadable manifest treated as empty

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for the manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for manifest operations
pub type ManifestResult<T> = Result<T, ManifestError>;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub status: EntryStatus,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    entries: BTreeMap<String, ManifestEntry>,
}

/// `id -> outcome` record for one collection directory
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Path of the manifest kept in `directory`.
    pub fn path_in(directory: &Path) -> PathBuf {
        directory.join(MANIFEST_FILE)
    }

    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the manifest at `path`. Missing or malformed files give an empty manifest.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read manifest {}: {}", path.display(), e);
                }
                return Self::empty(path);
            }
        };

        match serde_json::from_str::<ManifestFile>(&content) {
            Ok(file) => {
                debug!("Loaded manifest with {} entries", file.entries.len());
                Self {
                    path,
                    entries: file.entries,
                }
            }
            Err(e) => {
                warn!("Ignoring malformed manifest {}: {}", path.display(), e);
                Self::empty(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ManifestEntry> {
        self.entries.get(id)
    }

    /// Existing file for `id` if a previous run downloaded it and it is still there.
    pub fn reusable(&self, id: &str) -> Option<(&Path, Option<u64>)> {
        let entry = self.get(id)?;
        if entry.status != EntryStatus::Succeeded {
            return None;
        }
        let path = entry.path.as_deref()?;
        path.is_file().then_some((path, entry.bytes))
    }

    pub fn record_success(&mut self, id: &str, url: &str, path: &Path, bytes: u64, attempts: u32) {
        self.entries.insert(
            id.to_string(),
            ManifestEntry {
                status: EntryStatus::Succeeded,
                url: url.to_string(),
                path: Some(path.to_path_buf()),
                bytes: Some(bytes),
                reason: None,
                attempts,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn record_failure(&mut self, id: &str, url: &str, reason: &str, attempts: u32) {
        self.entries.insert(
            id.to_string(),
            ManifestEntry {
                status: EntryStatus::Failed,
                url: url.to_string(),
                path: None,
                bytes: None,
                reason: Some(reason.to_string()),
                attempts,
                updated_at: Utc::now(),
            },
        );
    }

    /// Write the manifest through a temp file and rename it into place.
    pub fn save(&self) -> ManifestResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = ManifestFile {
            entries: self.entries.clone(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        info!("Manifest saved to {} ({} entries)", self.path.display(), self.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_saved_manifest_is_reloaded() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        fs::write(&file, b"jpeg").unwrap();

        let mut manifest = Manifest::empty(Manifest::path_in(dir.path()));
        manifest.record_success("media-1", "https://x/a.jpg", &file, 4, 1);
        manifest.record_failure("media-2", "https://x/b.jpg", "HTTP error: 404", 1);
        manifest.save().unwrap();

        let reloaded = Manifest::load(Manifest::path_in(dir.path()));
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.reusable("media-1"), Some((file.as_path(), Some(4))));
        assert_eq!(reloaded.reusable("media-2"), None);
        assert_eq!(reloaded.get("media-2").unwrap().reason.as_deref(), Some("HTTP error: 404"));
    }

    #[test]
    fn test_succeeded_entry_without_file_is_not_reusable() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::empty(Manifest::path_in(dir.path()));
        manifest.record_success("media-1", "https://x/a.jpg", &dir.path().join("deleted.jpg"), 4, 1);

        assert_eq!(manifest.reusable("media-1"), None);
    }

    #[test]
    fn test_malformed_manifest_is_empty() {
        let dir = tempdir().unwrap();
        let path = Manifest::path_in(dir.path());
        fs::write(&path, "{ not json").unwrap();

        assert!(Manifest::load(&path).is_empty());
    }
}
