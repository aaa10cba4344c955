//! Write-then-rename persistence for small state files.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Returns the sibling temp path used while writing `path` (`<path>.tmp`).
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Perform an atomic write operation: write to `<path>.tmp`, sync, then rename.
///
/// Readers either see the previous complete contents or the new complete
/// contents. The parent directory is created when missing. On a failed rename
/// the temp file is removed and the previous file is left untouched.
///
/// # Examples
///
/// ```no_run
/// use hatch_common::atomic_write;
/// use std::path::Path;
///
/// atomic_write(Path::new("update_state.json"), b"{}").expect("Failed to write");
/// ```
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let temp_path = temp_path_for(path);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    #[cfg(windows)]
    {
        // rename onto an existing file fails on some Windows filesystems
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        }
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    #[cfg(unix)]
    {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}
