//! Multi-source update check with caching.

use chrono::{TimeDelta, Utc};
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::cache::CheckCache;
use crate::checker::{self, VersionChecker};
use crate::config::{CheckFrequency, UpdateConfig};
use crate::error::{UpdateError, UpdateResult};
use crate::release::{ReleaseInfo, UpdateEvent, UpdateEventKind};
use crate::state::UpdateState;
use crate::version::compare_versions;

/// Tries configured sources in priority order and caches the first answer.
pub struct UpdateChecker {
    config: UpdateConfig,
    checkers: Vec<Box<dyn VersionChecker>>,
    cache: Option<CheckCache>,
    current_version: String,
}

impl UpdateChecker {
    /// Build checkers for every enabled, well-formed source.
    ///
    /// Sources that cannot be turned into a checker are skipped with a warning.
    pub fn new(
        config: UpdateConfig,
        current_version: impl Into<String>,
        cache: Option<CheckCache>,
        client: &Client,
    ) -> Self {
        let mut checkers = Vec::new();
        for source in config.effective_sources() {
            if !source.enabled {
                tracing::debug!(kind = %source.kind.as_str(), priority = source.priority, "Skipping disabled source");
                continue;
            }
            match checker::from_source(&source, client) {
                Ok(checker) => {
                    tracing::info!(source = %checker.source_name(), priority = source.priority, "Initialized version checker");
                    checkers.push(checker);
                }
                Err(e) => {
                    tracing::warn!(kind = %source.kind.as_str(), error = %e, "Skipping misconfigured source");
                }
            }
        }
        Self::with_checkers(config, current_version, cache, checkers)
    }

    /// Use explicit checkers, already in the order they should be consulted.
    pub fn with_checkers(
        config: UpdateConfig,
        current_version: impl Into<String>,
        cache: Option<CheckCache>,
        checkers: Vec<Box<dyn VersionChecker>>,
    ) -> Self {
        Self {
            config,
            checkers,
            cache,
            current_version: current_version.into(),
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn source_names(&self) -> Vec<String> {
        self.checkers.iter().map(|c| c.source_name()).collect()
    }

    pub fn cache(&self) -> Option<&CheckCache> {
        self.cache.as_ref()
    }

    /// Check for the latest release, consulting the cache unless `force_refresh`.
    pub async fn check(
        &self,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> UpdateResult<ReleaseInfo> {
        if self.checkers.is_empty() {
            return Err(UpdateError::configuration("no update sources configured"));
        }

        if force_refresh {
            tracing::info!("Force refresh enabled, ignoring cache");
        } else if let Some(release) = self.cached_release() {
            return Ok(release);
        }

        tracing::info!(
            source_count = self.checkers.len(),
            current_version = %self.current_version,
            "Starting multi-source version check"
        );

        let mut failed_sources = Vec::new();
        let mut last_error = None;
        for (attempt, checker) in self.checkers.iter().enumerate() {
            let source_name = checker.source_name();
            tracing::info!(attempt = attempt + 1, total = self.checkers.len(), source = %source_name, "Checking update source");

            match checker.check_latest(&self.current_version, cancel).await {
                Ok(mut release) => {
                    release.needs_checksum_check = self
                        .config
                        .source_by_name(&source_name)
                        .is_some_and(|s| s.need_check_checksum);

                    tracing::info!(source = %source_name, version = %release.version, is_newer = release.is_newer, "Retrieved version information");

                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.set(&release) {
                            tracing::warn!(error = %e, "Failed to cache update information");
                        }
                    }
                    return Ok(release);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(source = %source_name, error = %e, "Update source check failed, trying next source");
                    failed_sources.push(source_name);
                    last_error = Some(e);
                }
            }
        }

        tracing::error!(failed_sources = %failed_sources.join(","), "All update sources failed");
        let mut err = UpdateError::network(format!(
            "all {} update sources failed",
            self.checkers.len()
        ))
        .with_context("failed_sources", failed_sources.join(","))
        .with_context("source_count", self.checkers.len());
        if let Some(last) = last_error {
            err = err.with_cause(last);
        }
        Err(err)
    }

    /// A fresh copy of the cached release with `is_newer` recomputed against
    /// the live version. The cache file itself is left as written.
    fn cached_release(&self) -> Option<ReleaseInfo> {
        let entry = self.cache.as_ref()?.get()?;
        let is_newer = match compare_versions(&self.current_version, &entry.latest_version) {
            Ok(is_newer) => is_newer,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring cached release with unparseable version");
                return None;
            }
        };
        tracing::info!(cached_version = %entry.latest_version, cache_time = %entry.last_check, "Using cached update information");

        let mut release = entry.cached_release;
        release.is_newer = is_newer;
        Some(release)
    }

    /// Check and report progress through `on_event`:
    /// `CheckStarted`, then `CheckCompleted` plus `UpdateAvailable` or
    /// `NoUpdateAvailable`, or `Error` on failure.
    pub async fn check_with_events<F>(
        &self,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> UpdateResult<ReleaseInfo>
    where
        F: FnMut(UpdateEvent),
    {
        on_event(UpdateEvent::new(
            UpdateEventKind::CheckStarted,
            "Checking for updates...",
        ));

        let release = match self.check(false, cancel).await {
            Ok(release) => release,
            Err(e) => {
                on_event(UpdateEvent::failed("Failed to check for updates", &e));
                return Err(e);
            }
        };

        on_event(UpdateEvent::new(
            UpdateEventKind::CheckCompleted,
            "Update check completed",
        ));
        if release.is_newer {
            on_event(
                UpdateEvent::new(
                    UpdateEventKind::UpdateAvailable,
                    format!("New version {} is available", release.version),
                )
                .with_release(release.clone()),
            );
        } else {
            on_event(UpdateEvent::new(
                UpdateEventKind::NoUpdateAvailable,
                "You are running the latest version",
            ));
        }
        Ok(release)
    }

    /// Whether an automatic check is due given the configured frequency.
    pub fn should_check(&self, state: &UpdateState) -> bool {
        if !self.config.enabled {
            tracing::debug!("Updates disabled in configuration");
            return false;
        }

        let interval = match &self.config.check_frequency {
            CheckFrequency::Manual => return false,
            CheckFrequency::Startup => return true,
            CheckFrequency::Daily => TimeDelta::hours(24),
            CheckFrequency::Weekly => TimeDelta::days(7),
            CheckFrequency::Unknown(value) => {
                tracing::warn!(check_frequency = %value, "Unknown check frequency, defaulting to not checking");
                return false;
            }
        };

        match state.last_check_time {
            None => true,
            Some(last) => {
                let elapsed = Utc::now() - last;
                tracing::debug!(last_check = %last, elapsed_secs = elapsed.num_seconds(), "Evaluating check interval");
                elapsed >= interval
            }
        }
    }

    /// Run a check if one is due, stamping and saving `last_check_time`.
    ///
    /// Returns `Ok(None)` when no check was due.
    pub async fn check_scheduled(
        &self,
        state: &mut UpdateState,
        cancel: &CancellationToken,
    ) -> UpdateResult<Option<ReleaseInfo>> {
        if !self.should_check(state) {
            tracing::info!(check_frequency = %self.config.check_frequency, "Skipping scheduled update check");
            return Ok(None);
        }

        let result = self.check(false, cancel).await;
        state.record_check();
        if let Err(e) = state.save() {
            tracing::warn!(error = %e, "Failed to save update state after check");
        }
        result.map(Some)
    }
}
