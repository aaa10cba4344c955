//! `AppUpdater`: the check, download, apply and restart lifecycle for hosts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::apply::base::backup_path_for;
use crate::apply::{ApplyOutcome, UpdateApplier, platform_applier};
use crate::cache::{CACHE_FILE_NAME, CheckCache, DEFAULT_CACHE_TTL};
use crate::config::UpdateConfig;
use crate::download::{DownloadOptions, DownloadProgress, Downloader, default_download_dir};
use crate::error::{UpdateError, UpdateResult};
use crate::orchestrator::UpdateChecker;
use crate::release::{ReleaseInfo, UpdateEvent};
use crate::state::{UpdateState, default_state_path};
use crate::verify::validate_executable;
use crate::version::VersionInfo;

/// Version assumed when the host does not supply one.
pub const DEFAULT_CURRENT_VERSION: &str = "0.1.0";

/// Argument passed to the relaunched application after an update.
pub const RESTART_ARG: &str = "--update";

/// Construction options for [`AppUpdater`].
#[derive(Debug, Clone, Default)]
pub struct UpdaterOptions {
    pub config: UpdateConfig,
    /// Defaults to [`DEFAULT_CURRENT_VERSION`]
    pub current_version: Option<String>,
    /// Defaults to `~/.app_updater/update_state.json`; the check cache lives
    /// next to it
    pub state_path: Option<PathBuf>,
    /// Defaults to the running executable
    pub exec_path: Option<PathBuf>,
    /// Defaults to `<temp>/hatch-update`
    pub download_dir: Option<PathBuf>,
}

/// Facade over checking, downloading and installing updates.
///
/// Mutating operations take `&mut self`; hosts sharing one updater across
/// tasks serialize access themselves.
pub struct AppUpdater {
    config: UpdateConfig,
    current_version: String,
    exec_path: PathBuf,
    checker: UpdateChecker,
    downloader: Downloader,
    applier: Arc<dyn UpdateApplier>,
    state: UpdateState,
    latest_release: Option<ReleaseInfo>,
    downloaded_path: Option<PathBuf>,
}

impl AppUpdater {
    pub fn new(options: UpdaterOptions) -> UpdateResult<Self> {
        let UpdaterOptions {
            config,
            current_version,
            state_path,
            exec_path,
            download_dir,
        } = options;

        let current_version = current_version
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CURRENT_VERSION.to_string());

        let state_path = match state_path.or_else(default_state_path) {
            Some(path) => path,
            None => {
                return Err(UpdateError::configuration(
                    "cannot determine update state location",
                ));
            }
        };
        let cache_path = state_path
            .parent()
            .map(|dir| dir.join(CACHE_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(CACHE_FILE_NAME));

        let exec_path = match exec_path {
            Some(path) => path,
            None => std::env::current_exe()
                .map_err(|e| UpdateError::io("failed to locate running executable", e))?,
        };

        let client = hatch_common::create_client_with_timeout(config.timeout_duration())
            .map_err(|e| UpdateError::configuration(format!("failed to build HTTP client: {e}")))?;

        let mut state = UpdateState::load(&state_path);
        state.current_version = current_version.clone();

        let checker = UpdateChecker::new(
            config.clone(),
            current_version.clone(),
            Some(CheckCache::new(cache_path, DEFAULT_CACHE_TTL)),
            &client,
        );
        let downloader = Downloader::new(client)
            .with_options(DownloadOptions {
                timeout: config.timeout_duration(),
                ..DownloadOptions::default()
            })
            .with_download_dir(download_dir.unwrap_or_else(default_download_dir));

        tracing::info!(
            current_version = %current_version,
            exec_path = %exec_path.display(),
            sources = ?checker.source_names(),
            "Updater initialized"
        );

        Ok(Self {
            config,
            current_version,
            exec_path,
            checker,
            downloader,
            applier: Arc::from(platform_applier()),
            state,
            latest_release: None,
            downloaded_path: None,
        })
    }

    /// Replace the platform applier.
    pub fn with_applier(mut self, applier: Box<dyn UpdateApplier>) -> Self {
        self.applier = Arc::from(applier);
        self
    }

    /// Replace download retry and timeout settings.
    pub fn with_download_options(mut self, options: DownloadOptions) -> Self {
        self.downloader = self.downloader.with_options(options);
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo::new(&self.current_version, &self.config)
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    /// Release found by the last successful check.
    pub fn latest_release(&self) -> Option<&ReleaseInfo> {
        self.latest_release.as_ref()
    }

    /// Artifact produced by the last successful download.
    pub fn downloaded_path(&self) -> Option<&Path> {
        self.downloaded_path.as_deref()
    }

    fn remember(&mut self, result: UpdateResult<ReleaseInfo>) -> UpdateResult<ReleaseInfo> {
        if let Ok(release) = &result {
            self.latest_release = Some(release.clone());
        }
        result
    }

    /// Check for updates, using the cache when it is fresh.
    pub async fn check(&mut self, cancel: &CancellationToken) -> UpdateResult<ReleaseInfo> {
        let result = self.checker.check(false, cancel).await;
        self.remember(result)
    }

    /// Check for updates, bypassing the cache.
    pub async fn check_force(&mut self, cancel: &CancellationToken) -> UpdateResult<ReleaseInfo> {
        let result = self.checker.check(true, cancel).await;
        self.remember(result)
    }

    /// Check and report progress through `on_event`.
    pub async fn check_with_events<F>(
        &mut self,
        cancel: &CancellationToken,
        on_event: F,
    ) -> UpdateResult<ReleaseInfo>
    where
        F: FnMut(UpdateEvent) + Send,
    {
        let result = self.checker.check_with_events(cancel, on_event).await;
        self.remember(result)
    }

    /// Whether the configured schedule calls for a check now.
    pub fn should_check(&self) -> bool {
        self.checker.should_check(&self.state)
    }

    /// Check only if the schedule says so. `Ok(None)` means not due.
    pub async fn check_scheduled(
        &mut self,
        cancel: &CancellationToken,
    ) -> UpdateResult<Option<ReleaseInfo>> {
        let release = self.checker.check_scheduled(&mut self.state, cancel).await?;
        if let Some(release) = &release {
            self.latest_release = Some(release.clone());
        }
        Ok(release)
    }

    /// Download a release asset and remember where it landed.
    pub async fn download<F>(
        &mut self,
        release: &ReleaseInfo,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> UpdateResult<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let path = self
            .downloader
            .download_release(release, cancel, on_progress)
            .await?;
        self.downloaded_path = Some(path.clone());
        Ok(path)
    }

    /// Install `update_path` over the running executable.
    ///
    /// Backs up first and restores on any failure. A failure whose rollback
    /// also failed is reported with [`UpdateError::is_inconsistent_state`] set.
    pub async fn apply(&mut self, update_path: &Path) -> UpdateResult<ApplyOutcome> {
        if update_path.as_os_str().is_empty() {
            return Err(UpdateError::validation("update path is empty"));
        }

        let applier = Arc::clone(&self.applier);
        let update_path = update_path.to_path_buf();
        let exec_path = self.exec_path.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            apply_with_rollback(applier.as_ref(), &update_path, &exec_path)
        })
        .await
        .map_err(|e| UpdateError::filesystem("apply task failed").with_cause(e))??;

        self.state.record_update();
        if let Err(e) = self.state.save() {
            tracing::warn!(error = %e, "Failed to save update state after apply");
        }
        Ok(outcome)
    }

    /// Apply the last download, then relaunch with `--update`.
    pub async fn apply_then_restart(&mut self) -> UpdateResult<()> {
        let path = self
            .downloaded_path
            .clone()
            .ok_or_else(|| UpdateError::validation("no downloaded update to apply"))?;
        let outcome = self.apply(&path).await?;
        if outcome == ApplyOutcome::ScheduledForReboot {
            tracing::info!("Update takes effect after the next reboot");
        }
        self.restart(&[RESTART_ARG.to_string()])
    }

    /// Relaunch the application. Does not return on success.
    pub fn restart(&self, args: &[String]) -> UpdateResult<()> {
        tracing::info!(exec_path = %self.exec_path.display(), ?args, "Restarting application");
        self.applier.restart(&self.exec_path, args)
    }

    /// Check, download and install in one go.
    ///
    /// Returns the installed release, or `None` when there is nothing newer
    /// or the newer version was skipped.
    pub async fn perform_update<F>(
        &mut self,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> UpdateResult<Option<ReleaseInfo>>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let release = self.check(cancel).await?;
        if !release.is_newer {
            tracing::info!(version = %self.current_version, "Already up to date");
            return Ok(None);
        }
        if self.is_version_skipped(&release.version) {
            tracing::info!(version = %release.version, "Skipping update, version was skipped by user");
            return Ok(None);
        }

        let path = self.download(&release, cancel, on_progress).await?;
        self.apply(&path).await?;
        Ok(Some(release))
    }

    /// Never offer `version` again. Skipping twice is fine.
    pub fn skip_version(&mut self, version: &str) -> UpdateResult<()> {
        if !self.state.skip_version(version) {
            tracing::debug!(version, "Version already skipped");
            return Ok(());
        }
        tracing::info!(version, "Skipping version");
        self.state.save()
    }

    pub fn is_version_skipped(&self, version: &str) -> bool {
        self.state.is_version_skipped(version)
    }

    pub fn clear_skipped_versions(&mut self) -> UpdateResult<()> {
        self.state.clear_skipped_versions();
        self.state.save()
    }
}

/// Backup, apply, validate; restore on failure; clean up on success.
fn apply_with_rollback(
    applier: &dyn UpdateApplier,
    update_path: &Path,
    exec_path: &Path,
) -> UpdateResult<ApplyOutcome> {
    let backup = backup_path_for(exec_path);
    tracing::info!(update = %update_path.display(), target = %exec_path.display(), "Applying update");

    applier.backup(exec_path, &backup).map_err(|e| {
        UpdateError::filesystem("failed to create backup before update")
            .with_cause(e)
            .with_context("exec_path", exec_path.display())
            .with_context("backup_path", backup.display())
    })?;

    let outcome = match applier.apply(update_path, exec_path) {
        Ok(outcome) => outcome,
        Err(e) if e.is_inconsistent_state() => return Err(e),
        Err(e) => {
            return Err(restore_after(
                applier,
                &backup,
                exec_path,
                e,
                "update failed, rolled back to previous version",
            ));
        }
    };

    if outcome == ApplyOutcome::Replaced {
        if let Err(e) = validate_executable(exec_path) {
            return Err(restore_after(
                applier,
                &backup,
                exec_path,
                e,
                "executable validation failed, rolled back to previous version",
            ));
        }
    }

    if let Err(e) = applier.cleanup(&[update_path.to_path_buf(), backup]) {
        tracing::warn!(error = %e, "Failed to clean up after update");
    }
    tracing::info!(outcome = ?outcome, "Update applied");
    Ok(outcome)
}

fn restore_after(
    applier: &dyn UpdateApplier,
    backup: &Path,
    exec_path: &Path,
    cause: UpdateError,
    message: &str,
) -> UpdateError {
    tracing::error!(error = %cause, "Update failed, restoring backup");
    match applier.restore(backup, exec_path) {
        Ok(()) => {
            if let Err(e) = applier.cleanup(&[backup.to_path_buf()]) {
                tracing::warn!(error = %e, "Failed to remove backup after rollback");
            }
            cause.wrap(message)
        }
        Err(rollback_err) => {
            tracing::error!(error = %rollback_err, "Rollback failed, installation may be inconsistent");
            UpdateError::rollback_failed(cause, rollback_err)
        }
    }
}
