//! Plain-executable installs on Unix. macOS falls back to this outside a bundle.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{ApplyOutcome, ApplyPhase, PhaseTracker, UpdateApplier, base, roll_back};
use crate::error::{UpdateError, UpdateResult};

const DEFAULT_MODE: u32 = 0o755;

/// Replaces a single executable file.
#[derive(Debug, Default)]
pub struct UnixApplier;

impl UnixApplier {
    pub fn new() -> Self {
        Self
    }
}

/// Exists, is non-empty and has an execute bit.
fn verify_integrity(path: &Path) -> UpdateResult<()> {
    let meta = fs::metadata(path).map_err(|e| {
        UpdateError::io("installed executable is missing", e).with_context("path", path.display())
    })?;
    if meta.len() == 0 {
        return Err(UpdateError::filesystem("installed executable is empty")
            .with_context("path", path.display()));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(UpdateError::permission("installed file is not executable")
            .with_context("path", path.display())
            .with_context("mode", format!("{:o}", meta.permissions().mode() & 0o7777)));
    }
    Ok(())
}

/// Remove `target`, copy `new_exec` in and reapply `mode`.
fn swap(new_exec: &Path, target: &Path, mode: u32) -> UpdateResult<()> {
    base::remove_path(target).map_err(|e| {
        UpdateError::io("failed to remove old executable", e).with_context("path", target.display())
    })?;
    fs::copy(new_exec, target).map_err(|e| {
        UpdateError::io("failed to install new executable", e)
            .with_context("from", new_exec.display())
            .with_context("to", target.display())
    })?;
    fs::set_permissions(target, fs::Permissions::from_mode(mode)).map_err(|e| {
        UpdateError::io("failed to set executable permissions", e).with_context("path", target.display())
    })
}

impl UpdateApplier for UnixApplier {
    fn backup(&self, src: &Path, backup: &Path) -> UpdateResult<()> {
        base::backup(src, backup)
    }

    fn apply(&self, update_path: &Path, target: &Path) -> UpdateResult<ApplyOutcome> {
        let mut phases = PhaseTracker::new();
        let tag = |phases: &PhaseTracker, e: UpdateError| e.with_context("phase", phases.current());

        let extract_dir = tempfile::Builder::new()
            .prefix("hatch-update-")
            .tempdir()
            .map_err(|e| tag(&phases, UpdateError::io("failed to create extraction directory", e)))?;
        base::extract_archive(update_path, extract_dir.path()).map_err(|e| tag(&phases, e))?;

        let new_exec = base::find_first_executable(extract_dir.path()).ok_or_else(|| {
            tag(
                &phases,
                UpdateError::filesystem("no executable found in update")
                    .with_context("path", update_path.display()),
            )
        })?;
        phases.advance(ApplyPhase::Located)?;
        tracing::info!(executable = %new_exec.display(), "Located new executable");

        let size = fs::metadata(&new_exec).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(tag(
                &phases,
                UpdateError::validation("new executable is empty").with_context("path", new_exec.display()),
            ));
        }
        phases.advance(ApplyPhase::Validated)?;

        let mode = fs::metadata(target)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(DEFAULT_MODE);

        if let Err(e) = swap(&new_exec, target, mode) {
            return Err(roll_back(&mut phases, target, e));
        }
        phases.advance(ApplyPhase::Swapped)?;

        if let Err(e) = verify_integrity(target) {
            return Err(roll_back(&mut phases, target, e));
        }
        phases.advance(ApplyPhase::Verified)?;

        tracing::info!(target = %target.display(), mode = %format!("{mode:o}"), "Executable replaced");
        Ok(ApplyOutcome::Replaced)
    }

    fn restore(&self, backup: &Path, target: &Path) -> UpdateResult<()> {
        base::restore(backup, target)
    }

    fn cleanup(&self, paths: &[PathBuf]) -> UpdateResult<()> {
        base::cleanup(paths)
    }

    fn restart(&self, exec_path: &Path, args: &[String]) -> UpdateResult<()> {
        let mut cmd = Command::new(exec_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Detach into a new session so the child outlives us
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            UpdateError::io("failed to start updated application", e)
                .with_context("path", exec_path.display())
        })?;
        tracing::info!(pid = child.id(), path = %exec_path.display(), "Started updated application, exiting");
        std::process::exit(0);
    }
}
