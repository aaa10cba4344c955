//! `.app` bundle installs on macOS, from disk images or archives.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use regex::Regex;

use super::base::{self, ArchiveKind};
use super::{ApplyOutcome, ApplyPhase, PhaseTracker, UnixApplier, UpdateApplier, roll_back};
use crate::error::{UpdateError, UpdateResult};

const BUNDLE_SUFFIX: &str = ".app";

/// Replaces the whole `.app` bundle that contains the executable.
#[derive(Debug, Default)]
pub struct MacOsApplier {
    plain: UnixApplier,
}

impl MacOsApplier {
    pub fn new() -> Self {
        Self {
            plain: UnixApplier::new(),
        }
    }
}

/// Walk up from `exec_path` to the enclosing `.app` directory.
pub fn find_app_bundle(exec_path: &Path) -> Option<PathBuf> {
    exec_path
        .ancestors()
        .find(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(BUNDLE_SUFFIX))
        })
        .map(Path::to_path_buf)
}

/// First `.app` directory under `dir`.
fn find_bundle_in(dir: &Path) -> Option<PathBuf> {
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| {
            e.file_type().is_dir() && e.file_name().to_string_lossy().ends_with(BUNDLE_SUFFIX)
        })
        .map(|e| e.into_path())
}

/// Value of a `<key>` followed by a `<string>` in plist XML.
fn plist_string(xml: &str, key: &str) -> Option<String> {
    let pattern = format!(r"<key>{}</key>\s*<string>([^<]+)</string>", regex::escape(key));
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// A read-only disk image mount, detached on drop.
struct MountedImage {
    device: String,
    mount_point: PathBuf,
}

impl MountedImage {
    fn attach(dmg: &Path) -> UpdateResult<Self> {
        let output = Command::new("hdiutil")
            .args(["attach", "-nobrowse", "-readonly", "-plist"])
            .arg(dmg)
            .output()
            .map_err(|e| UpdateError::io("failed to run hdiutil", e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(UpdateError::filesystem("failed to attach disk image")
                .with_context("dmg", dmg.display())
                .with_context("output", String::from_utf8_lossy(&output.stderr).trim()));
        }

        match (plist_string(&stdout, "mount-point"), plist_string(&stdout, "dev-entry")) {
            (Some(mount_point), Some(device)) => {
                tracing::info!(dmg = %dmg.display(), mount_point = %mount_point, device = %device, "Disk image attached");
                Ok(Self {
                    device,
                    mount_point: PathBuf::from(mount_point),
                })
            }
            (mount_point, device) => {
                // Something was attached; try to detach whatever we can name
                if let Some(device) = &device {
                    detach(device);
                }
                Err(UpdateError::validation("failed to parse hdiutil attach output")
                    .with_context("mount_point", mount_point.unwrap_or_default())
                    .with_context("device", device.unwrap_or_default()))
            }
        }
    }
}

impl Drop for MountedImage {
    fn drop(&mut self) {
        detach(&self.device);
    }
}

fn detach(device: &str) {
    match Command::new("hdiutil").args(["detach", "-force", device]).output() {
        Ok(out) if out.status.success() => tracing::debug!(device, "Disk image detached"),
        Ok(out) => tracing::warn!(
            device,
            output = %String::from_utf8_lossy(&out.stderr).trim(),
            "Failed to detach disk image"
        ),
        Err(e) => tracing::warn!(device, error = %e, "Failed to run hdiutil detach"),
    }
}

/// Copy the bundle out of a disk image into `dest_dir`.
fn extract_app_from_dmg(dmg: &Path, dest_dir: &Path) -> UpdateResult<PathBuf> {
    let image = MountedImage::attach(dmg)?;
    let bundle = fs::read_dir(&image.mount_point)
        .map_err(|e| UpdateError::io("failed to read disk image", e))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| p.is_dir() && p.to_string_lossy().ends_with(BUNDLE_SUFFIX))
        .ok_or_else(|| {
            UpdateError::validation(".app bundle not found in disk image")
                .with_context("dmg", dmg.display())
                .with_context("mount_point", image.mount_point.display())
        })?;

    let name = bundle
        .file_name()
        .ok_or_else(|| UpdateError::validation("bundle has no name"))?;
    let dest = dest_dir.join(name);
    base::copy_dir_all(&bundle, &dest)?;
    tracing::info!(bundle = %dest.display(), "Copied bundle out of disk image");
    Ok(dest)
}

/// A `.app` directory with a non-empty `Contents/MacOS`.
fn validate_app_bundle(path: &Path) -> UpdateResult<()> {
    if !path.is_dir() || !path.to_string_lossy().ends_with(BUNDLE_SUFFIX) {
        return Err(UpdateError::validation("not a valid .app bundle")
            .with_context("path", path.display()));
    }
    let macos_dir = path.join("Contents").join("MacOS");
    let mut entries = fs::read_dir(&macos_dir).map_err(|e| {
        UpdateError::validation("invalid .app structure")
            .with_cause(e)
            .with_context("macos_dir", macos_dir.display())
    })?;
    if entries.next().is_none() {
        return Err(UpdateError::validation("no executable found in .app")
            .with_context("macos_dir", macos_dir.display()));
    }
    Ok(())
}

/// Make sure the bundle's primary executable can run.
fn ensure_executable_permission(bundle: &Path) -> UpdateResult<()> {
    let macos_dir = bundle.join("Contents").join("MacOS");
    let mut entries: Vec<PathBuf> = fs::read_dir(&macos_dir)
        .map_err(|e| UpdateError::io("failed to read MacOS directory", e))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    entries.sort();
    let exec = entries.first().ok_or_else(|| {
        UpdateError::validation("no executable found in MacOS directory")
            .with_context("macos_dir", macos_dir.display())
    })?;

    let mode = fs::metadata(exec)
        .map_err(|e| UpdateError::io("failed to stat executable", e))?
        .permissions()
        .mode();
    if mode & 0o111 == 0 {
        fs::set_permissions(exec, fs::Permissions::from_mode(0o755)).map_err(|e| {
            UpdateError::permission("failed to set execute permission")
                .with_cause(e)
                .with_context("exec", exec.display())
        })?;
        tracing::info!(exec = %exec.display(), "Repaired execute permission");
    }
    Ok(())
}

/// `codesign --verify`; any failure is a security error.
pub fn verify_code_signature(path: &Path) -> UpdateResult<()> {
    let output = Command::new("codesign")
        .args(["--verify", "--verbose"])
        .arg(path)
        .output()
        .map_err(|e| {
            UpdateError::security("failed to run codesign")
                .with_cause(e)
                .with_context("path", path.display())
        })?;
    if !output.status.success() {
        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::error!(path = %path.display(), output = %detail, "Code signature verification failed");
        return Err(UpdateError::security("code signature verification failed")
            .with_context("path", path.display())
            .with_context("output", detail));
    }
    tracing::info!(path = %path.display(), "Code signature verified");
    Ok(())
}

/// Rename, or copy then delete when crossing filesystems.
fn move_bundle(src: &Path, dst: &Path) -> UpdateResult<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    base::copy_dir_all(src, dst)?;
    if let Err(e) = fs::remove_dir_all(src) {
        tracing::debug!(path = %src.display(), error = %e, "Failed to remove staged bundle");
    }
    Ok(())
}

fn read_info_plist(bundle: &Path, key: &str) -> Option<String> {
    let plist = bundle.join("Contents").join("Info.plist");
    let output = Command::new("defaults").arg("read").arg(&plist).arg(key).output().ok()?;
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (output.status.success() && !value.is_empty()).then_some(value)
}

fn start_open(base_args: &[&str], args: &[String]) -> bool {
    let mut cmd = Command::new("open");
    cmd.args(base_args);
    if !args.is_empty() {
        cmd.arg("--args").args(args);
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    match cmd.status() {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to run open");
            false
        }
    }
}

/// Launch through LaunchServices: by path, then bundle id, then name.
fn try_open_launch(bundle: &Path, args: &[String]) -> bool {
    let path = bundle.to_string_lossy();
    if start_open(&["-n", path.as_ref()], args) {
        return true;
    }
    if let Some(id) = read_info_plist(bundle, "CFBundleIdentifier") {
        if start_open(&["-n", "-b", id.as_str()], args) {
            return true;
        }
    }
    let name = read_info_plist(bundle, "CFBundleName").or_else(|| {
        bundle
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
    });
    name.is_some_and(|name| start_open(&["-n", "-a", name.as_str()], args))
}

impl MacOsApplier {
    fn replace_bundle(&self, update_path: &Path, bundle: &Path, staging: &Path) -> UpdateResult<()> {
        let mut phases = PhaseTracker::new();
        let tag = |phases: &PhaseTracker, e: UpdateError| e.with_context("phase", phases.current());

        let new_bundle = match ArchiveKind::detect(update_path) {
            ArchiveKind::Dmg => extract_app_from_dmg(update_path, staging),
            _ => base::extract_archive(update_path, staging).and_then(|()| {
                find_bundle_in(staging).ok_or_else(|| {
                    UpdateError::validation("no .app bundle found in update archive")
                })
            }),
        }
        .map_err(|e| tag(&phases, e))?;
        phases.advance(ApplyPhase::Located)?;

        validate_app_bundle(&new_bundle).map_err(|e| tag(&phases, e))?;
        phases.advance(ApplyPhase::Validated)?;

        let swapped = base::remove_path(bundle)
            .map_err(|e| {
                UpdateError::io("failed to remove old .app bundle", e)
                    .with_context("app_bundle", bundle.display())
            })
            .and_then(|()| move_bundle(&new_bundle, bundle))
            .and_then(|()| ensure_executable_permission(bundle));
        if let Err(e) = swapped {
            return Err(roll_back(&mut phases, bundle, e));
        }
        phases.advance(ApplyPhase::Swapped)?;

        if let Err(e) = verify_code_signature(bundle) {
            return Err(roll_back(&mut phases, bundle, e));
        }
        phases.advance(ApplyPhase::Verified)?;
        Ok(())
    }
}

impl UpdateApplier for MacOsApplier {
    fn backup(&self, src: &Path, backup: &Path) -> UpdateResult<()> {
        base::backup(src, backup)
    }

    fn apply(&self, update_path: &Path, target: &Path) -> UpdateResult<ApplyOutcome> {
        let Some(bundle) = find_app_bundle(target) else {
            tracing::warn!(exec_path = %target.display(), "No .app bundle found, replacing executable only");
            return self.plain.apply(update_path, target);
        };
        tracing::info!(app_bundle = %bundle.display(), update = %update_path.display(), "Replacing .app bundle");

        let bundle_backup = base::backup_path_for(&bundle);
        base::backup(&bundle, &bundle_backup)?;

        let staging = tempfile::Builder::new()
            .prefix("hatch-update-")
            .tempdir()
            .map_err(|e| UpdateError::io("failed to create staging directory", e))?;
        let result = self.replace_bundle(update_path, &bundle, staging.path());

        // Keep the backup for manual recovery if the rollback itself failed
        let keep_backup = result.as_ref().is_err_and(|e| e.is_inconsistent_state());
        if !keep_backup {
            if let Err(e) = base::cleanup(&[bundle_backup]) {
                tracing::warn!(error = %e, "Failed to remove bundle backup");
            }
        }
        result.map(|()| ApplyOutcome::Replaced)
    }

    fn restore(&self, backup: &Path, target: &Path) -> UpdateResult<()> {
        base::restore(backup, target)
    }

    fn cleanup(&self, paths: &[PathBuf]) -> UpdateResult<()> {
        base::cleanup(paths)
    }

    fn restart(&self, exec_path: &Path, args: &[String]) -> UpdateResult<()> {
        if let Some(bundle) = find_app_bundle(exec_path) {
            tracing::info!(app_bundle = %bundle.display(), "Relaunching via LaunchServices");
            if try_open_launch(&bundle, args) {
                std::process::exit(0);
            }
            tracing::warn!("LaunchServices strategies failed, falling back to direct exec");
        }
        self.plain.restart(exec_path, args)
    }
}
