//! Version checkers: one strategy per kind of release source.

mod github;
mod http;
mod manifest;

use std::future::Future;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::config::{GITHUB_API_BASE, SourceKind, UpdateSource};
use crate::error::{UpdateError, UpdateResult};
use crate::release::ReleaseInfo;

pub use github::GitHubChecker;
pub use http::HttpManifestChecker;
pub use manifest::{AssetInfo, ReleaseManifest};

/// Queries one release source.
#[async_trait]
pub trait VersionChecker: Send + Sync {
    /// Fetch the latest release for this platform and compare it against
    /// `current_version`.
    async fn check_latest(
        &self,
        current_version: &str,
        cancel: &CancellationToken,
    ) -> UpdateResult<ReleaseInfo>;

    /// Source identity, e.g. `github:owner/repo` or `http:<manifest url>`.
    fn source_name(&self) -> String;
}

/// Build the checker for a configured source.
pub fn from_source(source: &UpdateSource, client: &Client) -> UpdateResult<Box<dyn VersionChecker>> {
    match &source.kind {
        SourceKind::GitHub => {
            let repo = source
                .github_repo
                .as_deref()
                .filter(|r| !r.is_empty())
                .ok_or_else(|| UpdateError::configuration("GitHub source missing repo"))?;
            let checker = GitHubChecker::new(client.clone(), repo)
                .with_token(source.github_token.clone())
                .with_api_base(source.api_base_url.as_deref().unwrap_or(GITHUB_API_BASE));
            Ok(Box::new(checker))
        }
        SourceKind::Http => {
            let url = source
                .manifest_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| UpdateError::configuration("HTTP source missing manifest URL"))?;
            Ok(Box::new(HttpManifestChecker::new(client.clone(), url)))
        }
        SourceKind::Unknown(kind) => Err(UpdateError::configuration("unknown source type")
            .with_context("type", kind)),
    }
}

/// Race `fut` against the cancellation token.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl Future<Output = UpdateResult<T>>,
) -> UpdateResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UpdateError::cancelled(format!("{what} cancelled"))),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_from_source_names() {
        let client = Client::new();

        let github = from_source(&UpdateSource::github("acme/app", 1), &client).unwrap();
        assert_eq!(github.source_name(), "github:acme/app");

        let http = from_source(
            &UpdateSource::http("https://updates.example.com/manifest.json", 2),
            &client,
        )
        .unwrap();
        assert_eq!(
            http.source_name(),
            "http:https://updates.example.com/manifest.json"
        );
    }

    #[test]
    fn test_from_source_rejects_incomplete_sources() {
        let client = Client::new();

        let mut source = UpdateSource::github("", 1);
        let err = from_source(&source, &client).err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Configuration);

        source.kind = SourceKind::Http;
        assert!(from_source(&source, &client).is_err());

        source.kind = SourceKind::Unknown("ftp".to_string());
        let err = from_source(&source, &client).err().unwrap();
        assert_eq!(err.context_value("type"), Some("ftp"));
    }

    #[tokio::test]
    async fn test_cancellable_returns_cancelled_error() {
        let token = CancellationToken::new();
        token.cancel();
        let result: UpdateResult<()> =
            cancellable(&token, "check", std::future::pending()).await;
        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.message(), "check cancelled");
    }
}
