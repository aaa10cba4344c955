//! Executable installs on Windows, deferring to the next reboot when the
//! running file is locked.

use std::fs;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use walkdir::WalkDir;

use super::{ApplyOutcome, ApplyPhase, PhaseTracker, UpdateApplier, base, roll_back};
use crate::error::{UpdateError, UpdateResult};

const MOVEFILE_REPLACE_EXISTING: u32 = 0x1;
const MOVEFILE_DELAY_UNTIL_REBOOT: u32 = 0x4;
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const DETACHED_PROCESS: u32 = 0x0000_0008;

#[derive(Debug, Default)]
pub struct WindowsApplier;

impl WindowsApplier {
    pub fn new() -> Self {
        Self
    }
}

fn find_first_exe(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
        })
        .map(|e| e.into_path())
}

fn wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

/// Stage `new_exe` as `<target>.new` and ask Windows to move it over
/// `target` on the next reboot.
fn schedule_delayed_replace(new_exe: &Path, target: &Path) -> UpdateResult<()> {
    let mut staged = target.as_os_str().to_owned();
    staged.push(".new");
    let staged = PathBuf::from(staged);

    fs::copy(new_exe, &staged).map_err(|e| {
        UpdateError::io("failed to stage new executable", e).with_context("path", staged.display())
    })?;

    let from = wide(&staged);
    let to = wide(target);
    let result = unsafe {
        windows_sys::Win32::Storage::FileSystem::MoveFileExW(
            from.as_ptr(),
            to.as_ptr(),
            MOVEFILE_DELAY_UNTIL_REBOOT | MOVEFILE_REPLACE_EXISTING,
        )
    };
    if result == 0 {
        let error = std::io::Error::last_os_error();
        return Err(UpdateError::io("failed to schedule replacement on reboot", error)
            .with_context("staged", staged.display())
            .with_context("target", target.display()));
    }
    Ok(())
}

fn replace_now(new_exe: &Path, target: &Path) -> std::io::Result<()> {
    base::remove_path(target)?;
    fs::copy(new_exe, target).map(|_| ())
}

impl UpdateApplier for WindowsApplier {
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

        let new_exe = find_first_exe(extract_dir.path()).ok_or_else(|| {
            tag(
                &phases,
                UpdateError::filesystem("no .exe found in update").with_context("path", update_path.display()),
            )
        })?;
        phases.advance(ApplyPhase::Located)?;

        if fs::metadata(&new_exe).map(|m| m.len()).unwrap_or(0) == 0 {
            return Err(tag(
                &phases,
                UpdateError::validation("new executable is empty").with_context("path", new_exe.display()),
            ));
        }
        phases.advance(ApplyPhase::Validated)?;

        let outcome = match replace_now(&new_exe, target) {
            Ok(()) => ApplyOutcome::Replaced,
            Err(e) => {
                tracing::warn!(target = %target.display(), error = %e, "Direct replace failed, scheduling for reboot");
                // A partial delete may have removed the old file; put it back first
                if !target.exists() {
                    if let Err(restore_err) = base::restore(&base::backup_path_for(target), target) {
                        return Err(roll_back(&mut phases, target, restore_err));
                    }
                }
                if let Err(e) = schedule_delayed_replace(&new_exe, target) {
                    return Err(roll_back(&mut phases, target, e));
                }
                ApplyOutcome::ScheduledForReboot
            }
        };
        phases.advance(ApplyPhase::Swapped)?;

        if outcome == ApplyOutcome::Replaced {
            let len = fs::metadata(target).map(|m| m.len()).unwrap_or(0);
            if len == 0 {
                return Err(roll_back(
                    &mut phases,
                    target,
                    UpdateError::filesystem("installed executable is empty")
                        .with_context("path", target.display()),
                ));
            }
        }
        phases.advance(ApplyPhase::Verified)?;

        tracing::info!(target = %target.display(), outcome = ?outcome, "Update applied");
        Ok(outcome)
    }

    fn restore(&self, backup: &Path, target: &Path) -> UpdateResult<()> {
        base::restore(backup, target)
    }

    fn cleanup(&self, paths: &[PathBuf]) -> UpdateResult<()> {
        base::cleanup(paths)
    }

    fn restart(&self, exec_path: &Path, args: &[String]) -> UpdateResult<()> {
        let child = Command::new(exec_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS)
            .spawn()
            .map_err(|e| {
                UpdateError::io("failed to start updated application", e)
                    .with_context("path", exec_path.display())
            })?;
        tracing::info!(pid = child.id(), path = %exec_path.display(), "Started updated application, exiting");
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_apply_zip_with_exe() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("app.exe");
        fs::write(&target, b"MZ old").unwrap();

        let update = dir.path().join("app_windows_amd64.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&update).unwrap());
        writer
            .start_file("app/app.exe", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"MZ new").unwrap();
        writer.finish().unwrap();

        let outcome = WindowsApplier::new().apply(&update, &target).unwrap();
        assert_eq!(outcome, ApplyOutcome::Replaced);
        assert_eq!(fs::read(&target).unwrap(), b"MZ new");
    }

    #[test]
    fn test_find_first_exe() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin").join("App.EXE"), b"MZ").unwrap();
        assert_eq!(find_first_exe(dir.path()), Some(dir.path().join("bin").join("App.EXE")));
    }
}
