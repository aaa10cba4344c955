//! Resumable, checksum-verified HTTPS downloads with progress tracking.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::checker::cancellable;
use crate::error::{UpdateError, UpdateResult};
use crate::release::ReleaseInfo;
use crate::verify::{calculate_sha256, checksums_match};

/// Minimum wall time between two progress reports.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Default directory for downloaded release assets.
pub fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("hatch-update")
}

/// Progress information during download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    /// Bytes on disk so far, including any resumed prefix
    pub bytes_downloaded: u64,
    /// Total bytes to download; 0 when the server did not say
    pub total_bytes: u64,
    /// 0-100
    pub percentage: f64,
    pub speed_bytes_per_sec: f64,
}

impl DownloadProgress {
    /// Get human-readable downloaded size.
    pub fn downloaded_human(&self) -> String {
        format_bytes(self.bytes_downloaded)
    }

    /// Get human-readable total size.
    pub fn total_human(&self) -> String {
        format_bytes(self.total_bytes)
    }

    pub fn speed_human(&self) -> String {
        format!("{}/s", format_bytes(self.speed_bytes_per_sec as u64))
    }
}

/// Format bytes as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Mask a credential for logging: `<not set>`, `***`, or its first and last
/// seven characters.
pub fn mask_authorization(value: Option<&str>) -> String {
    match value {
        None | Some("") => "<not set>".to_string(),
        Some(v) if v.chars().count() <= 20 => "***".to_string(),
        Some(v) => {
            let chars: Vec<char> = v.chars().collect();
            let head: String = chars[..7].iter().collect();
            let tail: String = chars[chars.len() - 7..].iter().collect();
            format!("{head}...{tail}")
        }
    }
}

/// Retry and resume behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * n`
    pub retry_delay: Duration,
    /// Upper bound for a single attempt, body included
    pub timeout: Duration,
    /// Continue from an existing `.tmp` file with a `Range` request
    pub resume: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            timeout: hatch_common::DOWNLOAD_TIMEOUT,
            resume: true,
        }
    }
}

/// One file to fetch.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub dest: PathBuf,
    /// Passed through verbatim, e.g. authorization for private assets
    pub headers: BTreeMap<String, String>,
    pub expected_checksum: Option<String>,
    pub skip_checksum: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.expected_checksum = checksum;
        self
    }

    pub fn skip_checksum(mut self, skip: bool) -> Self {
        self.skip_checksum = skip;
        self
    }

    /// Request for a release asset at `dest`, carrying its auth headers and
    /// checksum policy.
    pub fn for_release(release: &ReleaseInfo, dest: impl Into<PathBuf>) -> Self {
        Self::new(&release.asset_url, dest)
            .with_headers(release.extra_headers.clone())
            .with_checksum(release.checksum.clone())
            .skip_checksum(release.skip_checksum())
    }
}

/// Reject anything but `https://` before touching the network.
pub fn require_https(url: &str) -> UpdateResult<Url> {
    let parsed = Url::parse(url).map_err(|e| {
        UpdateError::security("download URL is not a valid URL")
            .with_cause(e)
            .with_context("url", url)
    })?;
    if parsed.scheme() != "https" {
        return Err(UpdateError::security("only HTTPS downloads are allowed")
            .with_context("url", url)
            .with_context("scheme", parsed.scheme()));
    }
    Ok(parsed)
}

/// Emits throttled progress reports.
struct ProgressTracker {
    started: Instant,
    last_report: Option<Instant>,
    resumed_from: u64,
}

impl ProgressTracker {
    fn new(resumed_from: u64) -> Self {
        Self {
            started: Instant::now(),
            last_report: None,
            resumed_from,
        }
    }

    fn snapshot(&self, downloaded: u64, total: u64) -> DownloadProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let fresh = downloaded.saturating_sub(self.resumed_from);
        DownloadProgress {
            bytes_downloaded: downloaded,
            total_bytes: total,
            percentage: if total > 0 {
                (downloaded as f64 / total as f64 * 100.0).min(100.0)
            } else {
                0.0
            },
            speed_bytes_per_sec: if elapsed > 0.0 { fresh as f64 / elapsed } else { 0.0 },
        }
    }

    fn tick(&mut self, downloaded: u64, total: u64) -> Option<DownloadProgress> {
        let now = Instant::now();
        if self
            .last_report
            .is_some_and(|last| now.duration_since(last) < PROGRESS_INTERVAL)
        {
            return None;
        }
        self.last_report = Some(now);
        Some(self.snapshot(downloaded, total))
    }

    fn finish(&self, downloaded: u64, total: u64) -> DownloadProgress {
        let mut progress = self.snapshot(downloaded, total.max(downloaded));
        progress.percentage = 100.0;
        progress
    }
}

/// Download manager for update assets.
pub struct Downloader {
    client: Client,
    options: DownloadOptions,
    download_dir: PathBuf,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            options: DownloadOptions::default(),
            download_dir: default_download_dir(),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Download `request.url` to `request.dest` over HTTPS.
    ///
    /// Data lands in `<dest>.tmp` first and is renamed into place once the
    /// checksum matches. A cancelled download leaves the `.tmp` file behind
    /// so the next call can resume.
    pub async fn download<F>(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> UpdateResult<()>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        require_https(&request.url)?;
        self.fetch_with_retry(request, cancel, on_progress).await
    }

    /// Download a release asset into the download directory, reusing a file
    /// of the same name when one is already there.
    pub async fn download_release<F>(
        &self,
        release: &ReleaseInfo,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> UpdateResult<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let name = release.asset_name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(UpdateError::validation("invalid asset name")
                .with_context("asset_name", name));
        }
        let dest = self.download_dir.join(name);

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            match release.checksum.as_deref().filter(|c| !c.is_empty()) {
                Some(expected) => {
                    let actual = calculate_sha256(&dest).await?;
                    if checksums_match(expected, &actual) {
                        tracing::info!(path = %dest.display(), "Update already downloaded and verified");
                        return Ok(dest);
                    }
                    tracing::warn!(path = %dest.display(), "Existing download does not match checksum, downloading again");
                    tokio::fs::remove_file(&dest).await.map_err(|e| {
                        UpdateError::io("failed to remove stale download", e)
                            .with_context("path", dest.display())
                    })?;
                }
                None => {
                    tracing::info!(path = %dest.display(), "Update already downloaded");
                    return Ok(dest);
                }
            }
        }

        tracing::info!(
            version = %release.version,
            asset = %release.asset_name,
            size = %format_bytes(release.asset_size),
            "Downloading update"
        );
        self.download(&DownloadRequest::for_release(release, &dest), cancel, on_progress)
            .await?;
        Ok(dest)
    }

    /// Retry loop, checksum verification and final rename. No scheme check.
    pub(crate) async fn fetch_with_retry<F>(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> UpdateResult<()>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let tmp = hatch_common::temp_path_for(&request.dest);
        if let Some(parent) = request.dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                UpdateError::io("failed to create download directory", e)
                    .with_context("path", parent.display())
            })?;
        }

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.options.retry_delay * attempt;
                tracing::info!(attempt, max_retries = self.options.max_retries, delay_ms = delay.as_millis() as u64, "Retrying download");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(UpdateError::cancelled("download cancelled")
                            .with_context("url", &request.url));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt(request, &tmp, cancel, &mut on_progress).await {
                Ok(()) => break,
                Err(e) if e.is_retriable() && attempt < self.options.max_retries => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Download attempt failed");
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.with_context("attempts", attempt + 1));
                }
            }
        }

        if request.skip_checksum {
            tracing::debug!(url = %request.url, "Skipping checksum verification");
        } else {
            self.verify_tmp(request, &tmp).await?;
        }

        tokio::fs::rename(&tmp, &request.dest).await.map_err(|e| {
            UpdateError::io("failed to move download into place", e)
                .with_context("from", tmp.display())
                .with_context("to", request.dest.display())
        })?;
        tracing::info!(path = %request.dest.display(), "Download complete");
        Ok(())
    }

    async fn verify_tmp(&self, request: &DownloadRequest, tmp: &Path) -> UpdateResult<()> {
        let Some(expected) = request.expected_checksum.as_deref().filter(|c| !c.trim().is_empty())
        else {
            remove_quietly(tmp).await;
            return Err(UpdateError::validation(
                "checksum verification required but no checksum available",
            )
            .with_context("url", &request.url));
        };

        let actual = calculate_sha256(tmp).await?;
        if !checksums_match(expected, &actual) {
            remove_quietly(tmp).await;
            return Err(UpdateError::validation("checksum mismatch")
                .with_context("expected", expected.trim().to_lowercase())
                .with_context("actual", actual)
                .with_context("url", &request.url));
        }
        tracing::debug!(checksum = %actual, "Checksum verified");
        Ok(())
    }

    /// One transfer attempt into `tmp`, resuming when possible.
    async fn attempt<F>(
        &self,
        request: &DownloadRequest,
        tmp: &Path,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> UpdateResult<()>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let mut allow_resume = self.options.resume;
        let (response, start) = loop {
            let start = if allow_resume {
                tokio::fs::metadata(tmp).await.map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };

            let mut builder = self.client.get(&request.url).timeout(self.options.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if start > 0 {
                builder = builder.header(RANGE, format!("bytes={start}-"));
            }
            tracing::debug!(
                url = %request.url,
                resume_from = start,
                authorization = %mask_authorization(
                    request
                        .headers
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(AUTHORIZATION.as_str()))
                        .map(|(_, v)| v.as_str())
                ),
                "Starting download request"
            );

            let response = cancellable(cancel, "download", async {
                builder.send().await.map_err(|e| {
                    UpdateError::network("download request failed")
                        .with_cause(e)
                        .with_context("url", &request.url)
                })
            })
            .await?;

            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && start > 0 {
                tracing::info!(resume_from = start, "Server rejected range request, restarting from scratch");
                allow_resume = false;
                remove_quietly(tmp).await;
                continue;
            }
            break (response, start);
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::network(format!(
                "download server returned status {}",
                status.as_u16()
            ))
            .with_context("url", &request.url)
            .with_context("status_code", status.as_u16()));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        // A 200 to a ranged request means the server sent the whole file
        let (append, start) = if status == StatusCode::PARTIAL_CONTENT && start > 0 {
            (true, start)
        } else {
            (false, 0)
        };
        let total = content_length.map(|len| len + start).unwrap_or(0);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(tmp)
            .await
            .map_err(|e| {
                UpdateError::io("failed to open temporary download file", e)
                    .with_context("path", tmp.display())
            })?;

        let mut tracker = ProgressTracker::new(start);
        let mut downloaded = start;
        if let Some(progress) = tracker.tick(downloaded, total) {
            on_progress(progress);
        }

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Keep what we have for the next resume
                    let _ = file.flush().await;
                    return Err(UpdateError::cancelled("download cancelled")
                        .with_context("url", &request.url)
                        .with_context("bytes_downloaded", downloaded));
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| {
                UpdateError::network("download interrupted")
                    .with_cause(e)
                    .with_context("url", &request.url)
                    .with_context("bytes_downloaded", downloaded)
            })?;

            file.write_all(&chunk).await.map_err(|e| {
                UpdateError::io("failed to write download data", e)
                    .with_context("path", tmp.display())
            })?;
            downloaded += chunk.len() as u64;

            if let Some(progress) = tracker.tick(downloaded, total) {
                on_progress(progress);
            }
        }

        file.flush().await.map_err(|e| {
            UpdateError::io("failed to flush download data", e).with_context("path", tmp.display())
        })?;
        file.sync_all().await.map_err(|e| {
            UpdateError::io("failed to sync download data", e).with_context("path", tmp.display())
        })?;

        if total > 0 && downloaded < total {
            return Err(UpdateError::network("download ended early")
                .with_context("url", &request.url)
                .with_context("bytes_downloaded", downloaded)
                .with_context("total_bytes", total));
        }

        on_progress(tracker.finish(downloaded, total));
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove temporary download");
        }
    }
}
