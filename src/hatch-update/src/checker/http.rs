//! Checker for a JSON release manifest served over HTTP.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;

use super::manifest::ReleaseManifest;
use super::{VersionChecker, cancellable};
use crate::error::{UpdateError, UpdateResult};
use crate::platform::platform_key;
use crate::release::ReleaseInfo;
use crate::version::{compare_versions, normalize_version};

pub struct HttpManifestChecker {
    client: Client,
    manifest_url: String,
    platform_key: String,
}

impl HttpManifestChecker {
    pub fn new(client: Client, manifest_url: impl Into<String>) -> Self {
        Self {
            client,
            manifest_url: manifest_url.into(),
            platform_key: platform_key(),
        }
    }

    /// Select assets for a platform other than the running one.
    pub fn with_platform_key(mut self, key: impl Into<String>) -> Self {
        self.platform_key = key.into();
        self
    }

    async fn fetch_manifest(&self) -> UpdateResult<ReleaseManifest> {
        let response = self
            .client
            .get(&self.manifest_url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                UpdateError::network("failed to fetch release manifest")
                    .with_cause(e)
                    .with_context("url", &self.manifest_url)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::network(format!(
                "manifest server returned status {}",
                status.as_u16()
            ))
            .with_context("url", &self.manifest_url)
            .with_context("status_code", status.as_u16()));
        }

        let bytes = response.bytes().await.map_err(|e| {
            UpdateError::network("failed to read release manifest")
                .with_cause(e)
                .with_context("url", &self.manifest_url)
        })?;
        ReleaseManifest::parse(&bytes)
    }

    async fn resolve(&self, current_version: &str) -> UpdateResult<ReleaseInfo> {
        let manifest = self.fetch_manifest().await?;
        let asset = manifest.asset_for_platform(&self.platform_key)?;
        let version = normalize_version(&manifest.version).to_string();
        let is_newer = compare_versions(current_version, &version)?;

        tracing::info!(
            url = %self.manifest_url,
            latest_version = %version,
            is_newer,
            asset_name = %asset.name,
            "Checked release manifest"
        );

        Ok(ReleaseInfo {
            published_at: manifest.published_at_utc()?,
            release_notes: manifest.release_notes.clone(),
            asset_url: asset.url.clone(),
            asset_name: asset.name.clone(),
            asset_size: u64::try_from(asset.size).unwrap_or_default(),
            checksum: Some(asset.checksum.clone()),
            extra_headers: BTreeMap::new(),
            is_newer,
            needs_checksum_check: false,
            version,
        })
    }
}

#[async_trait]
impl VersionChecker for HttpManifestChecker {
    async fn check_latest(
        &self,
        current_version: &str,
        cancel: &CancellationToken,
    ) -> UpdateResult<ReleaseInfo> {
        tracing::info!(url = %self.manifest_url, current_version, "Checking for updates from manifest");
        cancellable(cancel, "manifest check", self.resolve(current_version)).await
    }

    fn source_name(&self) -> String {
        format!("http:{}", self.manifest_url)
    }
}
