//! Release descriptors and check events.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// A discovered release, resolved to the asset for the current platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Version without a leading `v`
    pub version: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub release_notes: String,
    pub asset_url: String,
    pub asset_name: String,
    pub asset_size: u64,
    /// Hex SHA-256 of the asset, when the source publishes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Headers the download must send (authenticated asset URLs)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,
    /// Newer than the caller's current version
    #[serde(default)]
    pub is_newer: bool,
    /// The source that produced this release requires checksum verification
    #[serde(default)]
    pub needs_checksum_check: bool,
}

impl ReleaseInfo {
    /// Whether the download should skip checksum verification.
    ///
    /// Verification is skipped only when no checksum is known and the source
    /// does not require one. A required but missing checksum is left to the
    /// downloader to reject.
    pub fn skip_checksum(&self) -> bool {
        !self.needs_checksum_check && self.checksum.as_deref().is_none_or(str::is_empty)
    }
}

/// Kind of event emitted while checking for updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateEventKind {
    CheckStarted,
    CheckCompleted,
    UpdateAvailable,
    NoUpdateAvailable,
    Error,
}

impl UpdateEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckStarted => "check_started",
            Self::CheckCompleted => "check_completed",
            Self::UpdateAvailable => "update_available",
            Self::NoUpdateAvailable => "no_update_available",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for UpdateEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress notification for hosts rendering an update UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateEvent {
    pub kind: UpdateEventKind,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseInfo>,
    /// Rendered error for `Error` events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateEvent {
    pub fn new(kind: UpdateEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            release: None,
            error: None,
        }
    }

    pub fn with_release(mut self, release: ReleaseInfo) -> Self {
        self.release = Some(release);
        self
    }

    pub fn failed(message: impl Into<String>, err: &UpdateError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::new(UpdateEventKind::Error, message)
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_release() -> ReleaseInfo {
    ReleaseInfo {
        version: "1.1.0".to_string(),
        published_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .map(|d| d.with_timezone(&Utc))
            .unwrap(),
        release_notes: "Bug fixes".to_string(),
        asset_url: "https://example.com/app_linux_amd64.tar.gz".to_string(),
        asset_name: "app_linux_amd64.tar.gz".to_string(),
        asset_size: 1024,
        checksum: Some("ab".repeat(32)),
        extra_headers: BTreeMap::new(),
        is_newer: true,
        needs_checksum_check: false,
    }
}
