//! Persisted update state.
//!
//! Tracks the last check and update times, skipped versions, and the version
//! that was running when the state was last written. Persisted as pretty JSON,
//! by default at `~/.app_updater/update_state.json`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};

/// File name of the persisted state.
pub const STATE_FILE_NAME: &str = "update_state.json";

/// Default location of the state file under the user's home directory.
pub fn default_state_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".app_updater").join(STATE_FILE_NAME))
}

/// Mutable state shared across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateState {
    #[serde(skip)]
    path: PathBuf,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub skipped_versions: BTreeSet<String>,
    pub current_version: String,
}

impl UpdateState {
    /// Empty state bound to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Load state from disk. Returns empty state if the file is missing or
    /// cannot be parsed.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load update state, starting with empty state");
                Self::new(path)
            }
        }
    }

    /// Load state from disk; a missing file is empty state, a corrupt one is an error.
    pub fn try_load(path: &Path) -> UpdateResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new(path)),
            Err(e) => {
                return Err(UpdateError::io("failed to read state file", e)
                    .with_context("path", path.display()));
            }
        };

        let mut state: Self = serde_json::from_str(&content).map_err(|e| {
            UpdateError::validation("failed to parse update state")
                .with_cause(e)
                .with_context("path", path.display())
        })?;
        state.path = path.to_path_buf();
        Ok(state)
    }

    /// Persist atomically (`.tmp` then rename).
    pub fn save(&self) -> UpdateResult<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            UpdateError::filesystem("failed to serialize update state").with_cause(e)
        })?;
        hatch_common::atomic_write(&self.path, content.as_bytes()).map_err(|e| {
            UpdateError::io("failed to write state file", e)
                .with_context("path", self.path.display())
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark a version as skipped. Returns false when it already was.
    pub fn skip_version(&mut self, version: &str) -> bool {
        self.skipped_versions.insert(version.to_string())
    }

    pub fn is_version_skipped(&self, version: &str) -> bool {
        self.skipped_versions.contains(version)
    }

    pub fn clear_skipped_versions(&mut self) {
        self.skipped_versions.clear();
    }

    pub fn record_check(&mut self) {
        self.last_check_time = Some(Utc::now());
    }

    pub fn record_update(&mut self) {
        self.last_update_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_empty_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let state = UpdateState::load(&path);
        assert!(state.skipped_versions.is_empty());
        assert!(state.last_check_time.is_none());
        assert_eq!(state.path(), path.as_path());
    }

    #[test]
    fn test_corrupt_file_gives_empty_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        std::fs::write(&path, "][").unwrap();

        assert!(UpdateState::try_load(&path).is_err());
        let state = UpdateState::load(&path);
        assert_eq!(state, UpdateState::new(&path));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(STATE_FILE_NAME);

        let mut state = UpdateState::new(&path);
        state.current_version = "1.0.0".to_string();
        state.skip_version("1.1.0");
        state.skip_version("1.2.0-beta.1");
        state.record_check();
        state.record_update();
        state.save().unwrap();

        let loaded = UpdateState::load(&path);
        assert_eq!(loaded, state);
        assert!(!hatch_common::temp_path_for(&path).exists());
    }

    #[test]
    fn test_skip_version_is_idempotent() {
        let mut state = UpdateState::default();
        assert!(state.skip_version("1.1.0"));
        assert!(!state.skip_version("1.1.0"));
        assert_eq!(state.skipped_versions.len(), 1);
        assert!(state.is_version_skipped("1.1.0"));

        state.clear_skipped_versions();
        assert!(!state.is_version_skipped("1.1.0"));
    }

    #[test]
    fn test_duplicate_skipped_versions_collapse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"skipped_versions": ["1.0.1", "1.0.1"], "current_version": "1.0.0"}"#,
        )
        .unwrap();

        let state = UpdateState::try_load(&path).unwrap();
        assert_eq!(state.skipped_versions.len(), 1);
        assert_eq!(state.current_version, "1.0.0");
    }
}
