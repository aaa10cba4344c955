//! JSON release manifest served by HTTP sources.
//!
//! ```json
//! {
//!   "version": "1.2.0",
//!   "published_at": "2024-05-01T12:00:00Z",
//!   "release_notes": "...",
//!   "assets": {
//!     "darwin_arm64": { "url": "https://...", "size": 1234, "checksum": "<sha256>", "name": "app.dmg" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};

/// Download information for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetInfo {
    pub url: String,
    /// Size in bytes; signed so a bogus negative size is reported, not rejected by the parser
    pub size: i64,
    /// Hex SHA-256
    pub checksum: String,
    /// File name
    pub name: String,
}

impl AssetInfo {
    fn validate(&self, platform: &str) -> UpdateResult<()> {
        let invalid = |what: String| {
            Err(UpdateError::validation(format!("asset for platform {platform} {what}"))
                .with_context("platform", platform))
        };
        if self.url.is_empty() {
            return invalid("missing URL".to_string());
        }
        if self.size <= 0 {
            return invalid(format!("has invalid size: {}", self.size));
        }
        if self.checksum.is_empty() {
            return invalid("missing checksum".to_string());
        }
        if self.name.is_empty() {
            return invalid("missing name".to_string());
        }
        Ok(())
    }
}

/// Release manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseManifest {
    pub version: String,
    /// RFC3339 timestamp
    pub published_at: String,
    pub release_notes: String,
    /// Assets keyed by platform key (`linux_amd64`, `darwin_arm64`, ...)
    pub assets: BTreeMap<String, AssetInfo>,
}

impl ReleaseManifest {
    /// Parse and validate a manifest.
    pub fn parse(data: &[u8]) -> UpdateResult<Self> {
        if data.is_empty() {
            return Err(UpdateError::validation("manifest data is empty"));
        }
        let manifest: Self = serde_json::from_slice(data).map_err(|e| {
            UpdateError::validation("failed to parse manifest JSON").with_cause(e)
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check required fields and every asset entry.
    pub fn validate(&self) -> UpdateResult<()> {
        if self.version.is_empty() {
            return Err(UpdateError::validation(
                "manifest missing required field: version",
            ));
        }
        if self.published_at.is_empty() {
            return Err(UpdateError::validation(
                "manifest missing required field: published_at",
            ));
        }
        self.published_at_utc()?;
        if self.assets.is_empty() {
            return Err(UpdateError::validation(
                "manifest missing required field: assets",
            ));
        }
        for (platform, asset) in &self.assets {
            asset.validate(platform)?;
        }
        Ok(())
    }

    pub fn published_at_utc(&self) -> UpdateResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.published_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| {
                UpdateError::validation("manifest published_at is not valid RFC3339 format")
                    .with_cause(e)
                    .with_context("published_at", &self.published_at)
            })
    }

    /// Asset for `platform_key`; absence lists the keys that do exist.
    pub fn asset_for_platform(&self, platform_key: &str) -> UpdateResult<&AssetInfo> {
        self.assets.get(platform_key).ok_or_else(|| {
            let available: Vec<&str> = self.assets.keys().map(String::as_str).collect();
            UpdateError::validation(format!("no asset found for platform: {platform_key}"))
                .with_context("platform", platform_key)
                .with_context("available_assets", available.join(","))
        })
    }
}
