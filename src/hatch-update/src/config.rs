//! Update configuration types.
//!
//! Configuration is read once from YAML at startup and is immutable for the
//! rest of the run.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};

/// Default timeout in seconds for update operations.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default API root for Git-hosted releases.
pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// When to check for updates automatically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CheckFrequency {
    /// Check every time the application starts (default)
    #[default]
    Startup,
    Daily,
    Weekly,
    /// Never check automatically
    Manual,
    /// Unrecognized value, kept so it round-trips; never triggers a check
    Unknown(String),
}

impl CheckFrequency {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Startup => "startup",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Manual => "manual",
            Self::Unknown(s) => s,
        }
    }
}

impl From<String> for CheckFrequency {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "startup" => Self::Startup,
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            "manual" => Self::Manual,
            _ => Self::Unknown(value),
        }
    }
}

impl From<CheckFrequency> for String {
    fn from(value: CheckFrequency) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CheckFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release channel for updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseChannel {
    /// Stable releases (default)
    #[default]
    Stable,
    /// Beta releases
    Beta,
}

impl ReleaseChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
        }
    }
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of update source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceKind {
    /// Git-hosted releases (GitHub REST API)
    #[default]
    GitHub,
    /// Generic JSON manifest over HTTP
    Http,
    Unknown(String),
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GitHub => "github",
            Self::Http => "http",
            Self::Unknown(s) => s,
        }
    }
}

impl From<String> for SourceKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "github" => Self::GitHub,
            "http" => Self::Http,
            _ => Self::Unknown(value),
        }
    }
}

impl From<SourceKind> for String {
    fn from(value: SourceKind) -> Self {
        value.as_str().to_string()
    }
}

/// A single place to look for releases.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateSource {
    #[serde(rename = "type")]
    pub kind: SourceKind,

    /// Lower numbers are checked first
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub enabled: bool,

    /// Refuse to install when the checksum cannot be verified
    #[serde(default)]
    pub need_check_checksum: bool,

    /// Repository in `owner/repo` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    /// Override of the GitHub API root (enterprise hosts, tests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
}

impl UpdateSource {
    /// Create an enabled GitHub source.
    pub fn github(repo: impl Into<String>, priority: i32) -> Self {
        Self {
            kind: SourceKind::GitHub,
            priority,
            enabled: true,
            github_repo: Some(repo.into()),
            ..Default::default()
        }
    }

    /// Create an enabled HTTP manifest source.
    pub fn http(manifest_url: impl Into<String>, priority: i32) -> Self {
        Self {
            kind: SourceKind::Http,
            priority,
            enabled: true,
            manifest_url: Some(manifest_url.into()),
            ..Default::default()
        }
    }

    /// Identity of the source, matching the name its checker reports.
    pub fn source_name(&self) -> String {
        match self.kind {
            SourceKind::GitHub => {
                format!("github:{}", self.github_repo.as_deref().unwrap_or_default())
            }
            SourceKind::Http => {
                format!("http:{}", self.manifest_url.as_deref().unwrap_or_default())
            }
            SourceKind::Unknown(ref kind) => format!("{kind}:"),
        }
    }
}

/// Process-wide update configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub check_frequency: CheckFrequency,

    #[serde(default)]
    pub channel: ReleaseChannel,

    /// Download automatically instead of only notifying
    #[serde(default)]
    pub auto_download: bool,

    /// Timeout in seconds for update operations
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub sources: Vec<UpdateSource>,

    /// Use `dev_update_source` instead of `sources`
    #[serde(default)]
    pub dev_mode_enabled: bool,

    /// Version reported by development builds
    #[serde(default = "default_dev_version")]
    pub dev_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_update_source: Option<UpdateSource>,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_dev_version() -> String {
    "0.1.0".to_string()
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_frequency: CheckFrequency::Startup,
            channel: ReleaseChannel::Stable,
            auto_download: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            sources: Vec::new(),
            dev_mode_enabled: false,
            dev_version: default_dev_version(),
            dev_update_source: None,
        }
    }
}

impl UpdateConfig {
    /// Configuration for local development: a localhost manifest overrides
    /// the regular sources.
    pub fn development() -> Self {
        let mut github = UpdateSource::github("hatch-app/hatch", 1);
        github.need_check_checksum = true;

        Self {
            timeout: 60,
            dev_mode_enabled: true,
            dev_update_source: Some(UpdateSource::http(
                "http://localhost:8080/manifest.json",
                1,
            )),
            sources: vec![github],
            ..Self::default()
        }
    }

    /// Load config from a YAML file.
    ///
    /// A missing or malformed file yields the defaults; the problem is logged
    /// rather than returned so startup never fails on configuration.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Using default update configuration");
                Self::default()
            }
        }
    }

    /// Load config from a YAML file, reporting why it could not be used.
    pub fn try_load(path: &Path) -> UpdateResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UpdateError::configuration("failed to read config file")
                .with_cause(e)
                .with_context("path", path.display())
        })?;

        let mut config: Self = serde_yaml::from_str(&content).map_err(|e| {
            UpdateError::configuration("failed to parse config file (invalid YAML format)")
                .with_cause(e)
                .with_context("path", path.display())
        })?;

        if config.timeout == 0 {
            config.timeout = DEFAULT_TIMEOUT_SECS;
        }
        Ok(config)
    }

    /// Save config as YAML.
    pub fn save(&self, path: &Path) -> UpdateResult<()> {
        let content = serde_yaml::to_string(self).map_err(|e| {
            UpdateError::configuration("failed to serialize config").with_cause(e)
        })?;
        hatch_common::atomic_write(path, content.as_bytes()).map_err(|e| {
            UpdateError::io("failed to write config file", e).with_context("path", path.display())
        })
    }

    /// Sources to consult, in ascending priority.
    ///
    /// In dev mode with a dev source configured, that source replaces the
    /// regular list.
    pub fn effective_sources(&self) -> Vec<UpdateSource> {
        let mut sources = match (&self.dev_update_source, self.dev_mode_enabled) {
            (Some(dev), true) => vec![dev.clone()],
            _ => self.sources.clone(),
        };
        sources.sort_by_key(|s| s.priority);
        sources
    }

    /// Look up the configured source a checker reported as `source_name`.
    pub fn source_by_name(&self, source_name: &str) -> Option<&UpdateSource> {
        self.sources
            .iter()
            .chain(self.dev_update_source.iter())
            .find(|s| s.source_name() == source_name)
    }

    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout)
    }
}
