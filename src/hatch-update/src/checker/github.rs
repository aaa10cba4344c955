//! Latest-release checker for GitHub-hosted releases.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{VersionChecker, cancellable};
use crate::config::GITHUB_API_BASE;
use crate::error::{UpdateError, UpdateResult};
use crate::platform::{asset_matches_platform, platform_key};
use crate::release::ReleaseInfo;
use crate::version::{compare_versions, is_valid_semver, normalize_version};

const GITHUB_JSON: &str = "application/vnd.github.v3+json";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct GitHubAsset {
    name: String,
    /// API URL; needs `Accept: application/octet-stream` to return the bytes
    #[serde(default)]
    url: String,
    #[serde(default)]
    browser_download_url: String,
    #[serde(default)]
    size: u64,
}

/// Checks `GET /repos/{repo}/releases/latest`.
pub struct GitHubChecker {
    client: Client,
    repo: String,
    token: Option<String>,
    api_base: String,
    platform_key: String,
}

impl GitHubChecker {
    pub fn new(client: Client, repo: impl Into<String>) -> Self {
        Self {
            client,
            repo: repo.into(),
            token: None,
            api_base: GITHUB_API_BASE.to_string(),
            platform_key: platform_key(),
        }
    }

    /// Authenticate API and asset requests (private repositories).
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Select assets for a platform other than the running one.
    pub fn with_platform_key(mut self, key: impl Into<String>) -> Self {
        self.platform_key = key.into();
        self
    }

    fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("token {t}"))
    }

    async fn fetch_release(&self) -> UpdateResult<GitHubRelease> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, self.repo);
        let mut request = self.client.get(&url).header(ACCEPT, GITHUB_JSON);
        if let Some(auth) = self.authorization() {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request.send().await.map_err(|e| {
            UpdateError::network("failed to fetch GitHub release")
                .with_cause(e)
                .with_context("repo", &self.repo)
        })?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            if let Some(remaining) = header("x-ratelimit-remaining") {
                let reset = header("x-ratelimit-reset").unwrap_or_default();
                tracing::warn!(remaining = %remaining, reset = %reset, "GitHub API rate limit exceeded");
                return Err(UpdateError::network("GitHub API rate limit exceeded")
                    .with_context("repo", &self.repo)
                    .with_context("rate_limit_remaining", remaining)
                    .with_context("rate_limit_reset", reset));
            }
        }
        if status == StatusCode::NOT_FOUND {
            return Err(UpdateError::network("no releases found for repository")
                .with_context("repo", &self.repo)
                .with_context("status_code", status.as_u16()));
        }
        if !status.is_success() {
            return Err(
                UpdateError::network(format!("GitHub API returned status {}", status.as_u16()))
                    .with_context("repo", &self.repo)
                    .with_context("status_code", status.as_u16()),
            );
        }

        let bytes = response.bytes().await.map_err(|e| {
            UpdateError::network("failed to read GitHub release response").with_cause(e)
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            UpdateError::validation("failed to parse GitHub release response").with_cause(e)
        })
    }

    /// Download the checksum list and pull out the line for `asset_name`.
    async fn fetch_checksum(&self, checksum_asset: &GitHubAsset, asset_name: &str) -> UpdateResult<String> {
        let mut request = match (self.authorization(), checksum_asset.url.is_empty()) {
            (Some(auth), false) => self
                .client
                .get(&checksum_asset.url)
                .header(ACCEPT, OCTET_STREAM)
                .header(AUTHORIZATION, auth),
            _ => self.client.get(&checksum_asset.browser_download_url),
        };
        request = request.timeout(hatch_common::DEFAULT_TIMEOUT);

        let response = request
            .send()
            .await
            .map_err(|e| UpdateError::network("failed to download checksum file").with_cause(e))?;
        if !response.status().is_success() {
            return Err(UpdateError::network("failed to download checksum file")
                .with_context("status_code", response.status().as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| UpdateError::network("failed to read checksum file").with_cause(e))?;

        parse_checksum_file(&body, asset_name).ok_or_else(|| {
            UpdateError::validation("checksum not found for asset")
                .with_context("asset", asset_name)
        })
    }

    async fn resolve(&self, current_version: &str) -> UpdateResult<ReleaseInfo> {
        let release = self.fetch_release().await?;

        if release.tag_name.is_empty() {
            return Err(UpdateError::validation(
                "GitHub release missing tag_name field",
            ));
        }
        let version = normalize_version(&release.tag_name).to_string();
        if !is_valid_semver(&version) {
            return Err(UpdateError::validation(format!(
                "GitHub release tag_name '{}' is not a valid semver format",
                release.tag_name
            ))
            .with_context("tag_name", &release.tag_name));
        }
        if release.assets.is_empty() {
            return Err(UpdateError::validation("GitHub release has no assets")
                .with_context("tag_name", &release.tag_name));
        }

        let is_newer = compare_versions(current_version, &version)?;

        let asset = release
            .assets
            .iter()
            .find(|a| asset_matches_platform(&a.name, &self.platform_key))
            .ok_or_else(|| {
                let names: Vec<&str> = release.assets.iter().map(|a| a.name.as_str()).collect();
                UpdateError::validation("no asset found for current platform")
                    .with_context("platform", &self.platform_key)
                    .with_context("available_assets", names.join(","))
            })?;

        let checksum = match release.assets.iter().find(|a| is_checksum_asset(&a.name)) {
            Some(checksum_asset) => match self.fetch_checksum(checksum_asset, &asset.name).await {
                Ok(sum) => Some(sum),
                Err(e) => {
                    tracing::warn!(asset = %asset.name, error = %e, "Could not extract checksum, continuing without it");
                    None
                }
            },
            None => None,
        };

        let mut extra_headers = BTreeMap::new();
        let asset_url = match self.authorization() {
            Some(auth) if !asset.url.is_empty() => {
                extra_headers.insert(AUTHORIZATION.as_str().to_string(), auth);
                extra_headers.insert(ACCEPT.as_str().to_string(), OCTET_STREAM.to_string());
                asset.url.clone()
            }
            _ => asset.browser_download_url.clone(),
        };

        let published_at = release
            .published_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        tracing::info!(
            repo = %self.repo,
            latest_version = %version,
            is_newer,
            asset_name = %asset.name,
            has_checksum = checksum.is_some(),
            "Checked GitHub release"
        );

        Ok(ReleaseInfo {
            version,
            published_at,
            release_notes: release.body.unwrap_or_default(),
            asset_url,
            asset_name: asset.name.clone(),
            asset_size: asset.size,
            checksum,
            extra_headers,
            is_newer,
            needs_checksum_check: false,
        })
    }
}

#[async_trait]
impl VersionChecker for GitHubChecker {
    async fn check_latest(
        &self,
        current_version: &str,
        cancel: &CancellationToken,
    ) -> UpdateResult<ReleaseInfo> {
        tracing::info!(repo = %self.repo, current_version, "Checking for updates from GitHub");
        cancellable(cancel, "GitHub release check", self.resolve(current_version)).await
    }

    fn source_name(&self) -> String {
        format!("github:{}", self.repo)
    }
}

fn is_checksum_asset(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("checksum") || lower.ends_with(".sha256")
}

/// Find the checksum for `asset_name` in `sha256sum`-style output.
///
/// Each line is `<checksum> <filename>`; the last whitespace field is the file
/// name, optionally prefixed with `*` (binary mode).
pub(crate) fn parse_checksum_file(content: &str, asset_name: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                return None;
            }
            let file = fields[fields.len() - 1].trim_start_matches('*');
            (file == asset_name || file.contains(asset_name)).then(|| fields[0].to_lowercase())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "linux_amd64";

    fn release_json(server: &MockServer, tag: &str) -> serde_json::Value {
        serde_json::json!({
            "tag_name": tag,
            "name": "Release",
            "body": "Notes",
            "published_at": "2024-05-01T12:00:00Z",
            "assets": [
                {
                    "name": "app_1.1.0_linux_amd64.tar.gz",
                    "url": format!("{}/repos/acme/app/releases/assets/1", server.uri()),
                    "browser_download_url": format!("{}/download/app_1.1.0_linux_amd64.tar.gz", server.uri()),
                    "size": 2048
                },
                {
                    "name": "checksums.txt",
                    "url": format!("{}/repos/acme/app/releases/assets/2", server.uri()),
                    "browser_download_url": format!("{}/download/checksums.txt", server.uri()),
                    "size": 120
                }
            ]
        })
    }

    fn checker(server: &MockServer) -> GitHubChecker {
        GitHubChecker::new(hatch_common::create_default_client().unwrap(), "acme/app")
            .with_api_base(server.uri())
            .with_platform_key(KEY)
    }

    #[test]
    fn test_parse_checksum_file() {
        let content = "\
# sha256
ABCDEF0123  app_1.1.0_darwin_arm64.tar.gz
0123456789  *app_1.1.0_linux_amd64.tar.gz

";
        assert_eq!(
            parse_checksum_file(content, "app_1.1.0_linux_amd64.tar.gz").as_deref(),
            Some("0123456789")
        );
        assert_eq!(
            parse_checksum_file(content, "app_1.1.0_darwin_arm64.tar.gz").as_deref(),
            Some("abcdef0123")
        );
        assert_eq!(parse_checksum_file(content, "app_windows.zip"), None);
        assert_eq!(parse_checksum_file("onlyonefield\n", "onlyonefield"), None);
    }

    #[tokio::test]
    async fn test_check_latest_public_release() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/latest"))
            .and(header("accept", GITHUB_JSON))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json(&server, "v1.1.0")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/checksums.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("deadbeef  app_1.1.0_linux_amd64.tar.gz\n"),
            )
            .mount(&server)
            .await;

        let release = checker(&server)
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(release.version, "1.1.0");
        assert!(release.is_newer);
        assert_eq!(release.asset_name, "app_1.1.0_linux_amd64.tar.gz");
        assert_eq!(release.asset_size, 2048);
        assert_eq!(release.checksum.as_deref(), Some("deadbeef"));
        assert!(release.asset_url.ends_with("/download/app_1.1.0_linux_amd64.tar.gz"));
        assert!(release.extra_headers.is_empty());
        assert_eq!(release.release_notes, "Notes");
    }

    #[tokio::test]
    async fn test_check_latest_with_token_uses_api_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/latest"))
            .and(header("authorization", "token s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json(&server, "1.1.0")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/assets/2"))
            .and(header("accept", OCTET_STREAM))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("cafe  app_1.1.0_linux_amd64.tar.gz\n"),
            )
            .mount(&server)
            .await;

        let release = checker(&server)
            .with_token(Some("s3cret".to_string()))
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap();

        assert!(release.asset_url.ends_with("/repos/acme/app/releases/assets/1"));
        assert_eq!(
            release.extra_headers.get("authorization").map(String::as_str),
            Some("token s3cret")
        );
        assert_eq!(
            release.extra_headers.get("accept").map(String::as_str),
            Some(OCTET_STREAM)
        );
        assert_eq!(release.checksum.as_deref(), Some("cafe"));
    }

    #[tokio::test]
    async fn test_missing_checksum_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json(&server, "v1.1.0")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/checksums.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let release = checker(&server)
            .check_latest("1.1.0", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!release.is_newer);
        assert_eq!(release.checksum, None);
    }

    #[tokio::test]
    async fn test_rate_limit_is_network_error_with_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/latest"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("X-RateLimit-Remaining", "0")
                    .insert_header("X-RateLimit-Reset", "1700000000"),
            )
            .mount(&server)
            .await;

        let err = checker(&server)
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.message(), "GitHub API rate limit exceeded");
        assert_eq!(err.context_value("rate_limit_remaining"), Some("0"));
        assert_eq!(err.context_value("rate_limit_reset"), Some("1700000000"));
    }

    #[tokio::test]
    async fn test_invalid_tag_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json(&server, "nightly")))
            .mount(&server)
            .await;

        let err = checker(&server)
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(err.context_value("tag_name"), Some("nightly"));
    }

    #[tokio::test]
    async fn test_no_assets_and_no_platform_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/latest"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"tag_name": "v2.0.0", "assets": []})),
            )
            .mount(&server)
            .await;

        let err = checker(&server)
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.message(), "GitHub release has no assets");

        let err = checker(&server)
            .with_platform_key("windows_arm64")
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn test_platform_mismatch_lists_assets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_json(&server, "v1.1.0")))
            .mount(&server)
            .await;

        let err = checker(&server)
            .with_platform_key("windows_arm64")
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.message(), "no asset found for current platform");
        assert_eq!(err.context_value("platform"), Some("windows_arm64"));
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = checker(&server)
            .check_latest("1.0.0", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.context_value("status_code"), Some("502"));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_cancelled_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(release_json(&server, "v1.1.0"))
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = checker(&server).check_latest("1.0.0", &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.category(), ErrorCategory::Network);
    }
}
