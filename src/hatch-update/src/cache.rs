//! Short-lived on-disk cache of the last successful check.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};
use crate::release::ReleaseInfo;

/// How long a successful check result is reused.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// File name of the cache next to the update state.
pub const CACHE_FILE_NAME: &str = "update_cache.json";

/// Cached result of the last successful check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub last_check: DateTime<Utc>,
    pub latest_version: String,
    pub cached_release: ReleaseInfo,
    pub cache_expiry: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.cache_expiry
    }
}

/// Persisted check cache with a fixed TTL.
#[derive(Debug, Clone)]
pub struct CheckCache {
    path: PathBuf,
    ttl: Duration,
}

impl CheckCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Load the entry if it is present, parseable, non-empty and unexpired.
    ///
    /// Anything else is a miss, never an error.
    pub fn get(&self) -> Option<CacheEntry> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.path.display(), error = %e, "Update cache unreadable");
                }
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Update cache malformed");
                return None;
            }
        };

        if entry.latest_version.is_empty() || entry.is_expired() {
            return None;
        }
        Some(entry)
    }

    /// Store a release with `expiry = now + ttl`.
    pub fn set(&self, release: &ReleaseInfo) -> UpdateResult<()> {
        let now = Utc::now();
        let ttl = TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX);
        let entry = CacheEntry {
            last_check: now,
            latest_version: release.version.clone(),
            cached_release: release.clone(),
            cache_expiry: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let content = serde_json::to_string_pretty(&entry).map_err(|e| {
            UpdateError::filesystem("failed to serialize update cache").with_cause(e)
        })?;
        hatch_common::atomic_write(&self.path, content.as_bytes()).map_err(|e| {
            UpdateError::io("failed to write update cache", e)
                .with_context("path", self.path.display())
        })
    }

    /// Delete the cache file; a missing file is fine.
    pub fn invalidate(&self) -> UpdateResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpdateError::io("failed to remove update cache", e)
                .with_context("path", self.path.display())),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.get().is_some()
    }
}
