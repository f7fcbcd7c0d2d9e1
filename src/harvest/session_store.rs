//! Session Store for Feed Harvester
//!
//! This module provides functionality for:
//! 1. Persisting the browser's login state between runs
//! 2. Discarding sessions that are past their validity window
//! 3. Treating unreadable session files as absent instead of failing
//! 4. Atomic replacement of the persisted session

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for session persistence
#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for session persistence
pub type SessionStoreResult<T> = Result<T, SessionStoreError>;

/// Default validity window for a saved session.
pub const DEFAULT_VALIDITY_DAYS: i64 = 30;

/// A reusable login, opaque apart from its validity window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub credentials: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(credentials: serde_json::Value, now: DateTime<Utc>, validity: Duration) -> Self {
        Self {
            credentials,
            created_at: now,
            expires_at: now + validity,
        }
    }
}

/// File-backed, single-writer store for one [`Session`]
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pure expiry check
    pub fn is_valid(session: &Session, now: DateTime<Utc>) -> bool {
        now < session.expires_at
    }

    /// Load the persisted session, if there is a fresh one.
    pub fn load(&self) -> Option<Session> {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Option<Session> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No session file at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read session file {}: {}", self.path.display(), e);
                return None;
            }
        };

        let session: Session = match serde_json::from_str(&content) {
            Ok(session) => session,
            Err(e) => {
                warn!("CorruptSession: discarding unreadable session file: {}", e);
                self.discard();
                return None;
            }
        };

        if !Self::is_valid(&session, now) {
            info!("Saved session expired at {}, discarding", session.expires_at);
            self.discard();
            return None;
        }

        debug!("Loaded session created at {}", session.created_at);
        Some(session)
    }

    /// Persist `session`, replacing whatever was there.
    pub fn save(&self, session: &Session) -> SessionStoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(session)?)?;
        fs::rename(&tmp, &self.path)?;
        info!("Session saved to {} (expires {})", self.path.display(), session.expires_at);
        Ok(())
    }

    /// Remove persisted state. Succeeds when there is nothing to remove.
    pub fn clear(&self) -> SessionStoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Cleared session at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn discard(&self) {
        if let Err(e) = self.clear() {
            warn!("Failed to remove stale session file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn cookies() -> serde_json::Value {
        json!([{ "name": "sessionid", "value": "abc", "domain": ".example.org" }])
    }

    #[test]
    fn test_save_then_load_returns_fresh_session() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested/session.json"));
        let session = Session::new(cookies(), Utc::now(), Duration::days(DEFAULT_VALIDITY_DAYS));

        store.save(&session).unwrap();

        assert_eq!(store.load(), Some(session));
    }

    #[test]
    fn test_expired_session_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let created = Utc::now() - Duration::days(31);
        let session = Session::new(cookies(), created, Duration::days(30));
        store.save(&session).unwrap();

        assert!(!SessionStore::is_valid(&session, Utc::now()));
        assert_eq!(store.load(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_validity_boundary() {
        let now = Utc::now();
        let session = Session::new(cookies(), now, Duration::days(30));
        assert!(SessionStore::is_valid(&session, now + Duration::days(30) - Duration::seconds(1)));
        assert!(!SessionStore::is_valid(&session, now + Duration::days(30)));
    }

    #[test]
    fn test_malformed_session_is_absent_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{\"credentials\": [1, 2").unwrap();
        let store = SessionStore::new(&path);

        assert_eq!(store.load(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_save_overwrites_previous_session() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let first = Session::new(json!("first"), Utc::now(), Duration::days(1));
        let second = Session::new(json!("second"), Utc::now(), Duration::days(1));

        store.save(&first).unwrap();
        store.save(&second).unwrap();

        assert_eq!(store.load().unwrap().credentials, json!("second"));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        store.clear().unwrap();

        store.save(&Session::new(cookies(), Utc::now(), Duration::days(1))).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();

        assert_eq!(store.load(), None);
    }
}
