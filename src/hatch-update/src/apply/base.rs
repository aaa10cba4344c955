//! Backup, restore, cleanup and archive extraction shared by all platforms.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{UpdateError, UpdateResult};

/// Suffix appended to the installed path for its backup copy.
pub const BACKUP_SUFFIX: &str = ".backup";

/// `<path>.backup`
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Archive formats understood by [`extract_archive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    TarXz,
    Dmg,
    /// Anything else: the file is the executable
    Raw,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar.xz") {
            Self::TarXz
        } else if name.ends_with(".dmg") {
            Self::Dmg
        } else {
            Self::Raw
        }
    }
}

/// Total size in bytes of a file or directory tree.
pub fn total_size(path: &Path) -> UpdateResult<u64> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| UpdateError::io("failed to stat path", e).with_context("path", path.display()))?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| {
            UpdateError::filesystem("failed to walk directory")
                .with_cause(e)
                .with_context("path", path.display())
        })?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .map_err(|e| UpdateError::filesystem("failed to stat file").with_cause(e))?
                .len();
        }
    }
    Ok(total)
}

/// Remove a file or directory tree. Absence is fine.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy a directory tree, keeping permissions and recreating symlinks.
pub fn copy_dir_all(src: &Path, dst: &Path) -> UpdateResult<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            UpdateError::filesystem("failed to walk directory")
                .with_cause(e)
                .with_context("path", src.display())
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| UpdateError::filesystem("path outside copy root").with_cause(e))?;
        let out = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&out).map_err(|e| {
                UpdateError::io("failed to create directory", e).with_context("path", out.display())
            })?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &out)?;
        } else {
            fs::copy(entry.path(), &out).map_err(|e| {
                UpdateError::io("failed to copy file", e)
                    .with_context("from", entry.path().display())
                    .with_context("to", out.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> UpdateResult<()> {
    let target = fs::read_link(src)
        .map_err(|e| UpdateError::io("failed to read symlink", e).with_context("path", src.display()))?;
    std::os::unix::fs::symlink(&target, dst)
        .map_err(|e| UpdateError::io("failed to create symlink", e).with_context("path", dst.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> UpdateResult<()> {
    fs::copy(src, dst).map(|_| ()).map_err(|e| {
        UpdateError::io("failed to copy file", e).with_context("path", src.display())
    })
}

/// Copy a file or tree from `src` to `dst` and check the byte count matches.
fn copy_verified(src: &Path, dst: &Path) -> UpdateResult<u64> {
    let expected = total_size(src)?;

    remove_path(dst).map_err(|e| {
        UpdateError::io("failed to clear destination", e).with_context("path", dst.display())
    })?;
    if src.is_dir() {
        copy_dir_all(src, dst)?;
    } else {
        fs::copy(src, dst).map_err(|e| {
            UpdateError::io("failed to copy file", e)
                .with_context("from", src.display())
                .with_context("to", dst.display())
        })?;
    }

    let actual = total_size(dst)?;
    if actual != expected {
        return Err(UpdateError::filesystem("copied size does not match source")
            .with_context("expected_bytes", expected)
            .with_context("actual_bytes", actual)
            .with_context("path", dst.display()));
    }
    Ok(actual)
}

/// Copy the installed file or bundle aside.
pub fn backup(src: &Path, backup: &Path) -> UpdateResult<()> {
    if !src.exists() {
        return Err(UpdateError::filesystem("nothing to back up")
            .with_context("path", src.display()));
    }
    let bytes = copy_verified(src, backup).map_err(|e| e.wrap("failed to create backup"))?;
    tracing::info!(src = %src.display(), backup = %backup.display(), bytes, "Backup created");
    Ok(())
}

/// Put a backup back in place.
pub fn restore(backup: &Path, target: &Path) -> UpdateResult<()> {
    if !backup.exists() {
        return Err(UpdateError::filesystem("backup not found")
            .with_context("path", backup.display()));
    }
    let bytes = copy_verified(backup, target).map_err(|e| e.wrap("failed to restore backup"))?;
    tracing::info!(backup = %backup.display(), target = %target.display(), bytes, "Backup restored");
    Ok(())
}

/// Remove every path, continuing past failures. Returns the last failure.
pub fn cleanup(paths: &[PathBuf]) -> UpdateResult<()> {
    let mut last_err = None;
    for path in paths {
        match remove_path(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove");
                last_err = Some(UpdateError::io("failed to clean up", e).with_context("path", path.display()));
            }
        }
    }
    last_err.map_or(Ok(()), Err)
}

/// Validate that an archive entry stays inside `dest_dir`.
/// Prevents ZIP slip / path traversal attacks.
pub fn validate_path_safe(dest_dir: &Path, entry_name: &str) -> UpdateResult<PathBuf> {
    let unsafe_entry = |reason: &str| {
        Err(UpdateError::security(format!("unsafe archive entry: {reason}"))
            .with_context("entry", entry_name)
            .with_context("dest", dest_dir.display()))
    };

    if entry_name.contains('\0') {
        return unsafe_entry("null byte");
    }

    let entry_path = Path::new(entry_name);
    if entry_path.is_absolute() {
        return unsafe_entry("absolute path");
    }

    let mut resolved = dest_dir.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(name) => resolved.push(name),
            Component::CurDir => {}
            Component::ParentDir => return unsafe_entry("path traversal"),
            Component::Prefix(_) | Component::RootDir => return unsafe_entry("rooted path"),
        }
    }

    if !resolved.starts_with(dest_dir) {
        return unsafe_entry("escapes destination");
    }
    Ok(resolved)
}

fn create_parent(path: &Path) -> UpdateResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            UpdateError::io("failed to create directory", e).with_context("path", parent.display())
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        tracing::debug!(path = %path.display(), error = %e, "Failed to set permissions");
    }
}

/// Safely extract a tar archive with path validation.
///
/// Symlinks and hard links are skipped.
pub fn safe_tar_unpack<R: io::Read>(archive: &mut tar::Archive<R>, dest_dir: &Path) -> UpdateResult<()> {
    let corrupt = |e: io::Error| UpdateError::io("failed to read tar archive", e);

    for entry_result in archive.entries().map_err(corrupt)? {
        let mut entry = entry_result.map_err(corrupt)?;
        let entry_name = entry.path().map_err(corrupt)?.to_string_lossy().to_string();
        let outpath = validate_path_safe(dest_dir, &entry_name)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&outpath).map_err(|e| {
                    UpdateError::io("failed to create directory", e)
                        .with_context("path", outpath.display())
                })?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                create_parent(&outpath)?;
                let mut outfile = File::create(&outpath).map_err(|e| {
                    UpdateError::io("failed to create file", e).with_context("path", outpath.display())
                })?;
                io::copy(&mut entry, &mut outfile).map_err(corrupt)?;

                #[cfg(unix)]
                {
                    if let Ok(mode) = entry.header().mode() {
                        set_mode(&outpath, mode);
                    }
                }
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                tracing::warn!(entry = %entry_name, "Skipping link in update archive");
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> UpdateResult<()> {
    let file = File::open(archive_path).map_err(|e| {
        UpdateError::io("failed to open archive", e).with_context("path", archive_path.display())
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        UpdateError::filesystem("failed to read zip archive")
            .with_cause(e)
            .with_context("path", archive_path.display())
    })?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| {
            UpdateError::filesystem("failed to read zip entry").with_cause(e).with_context("index", i)
        })?;
        let entry_name = entry.name().to_string();
        let outpath = validate_path_safe(dest_dir, &entry_name)?;

        if entry.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| {
                UpdateError::io("failed to create directory", e).with_context("path", outpath.display())
            })?;
            continue;
        }

        create_parent(&outpath)?;
        let mut outfile = File::create(&outpath).map_err(|e| {
            UpdateError::io("failed to create file", e).with_context("path", outpath.display())
        })?;
        io::copy(&mut entry, &mut outfile).map_err(|e| {
            UpdateError::io("failed to extract zip entry", e).with_context("entry", &entry_name)
        })?;

        #[cfg(unix)]
        {
            if let Some(mode) = entry.unix_mode() {
                set_mode(&outpath, mode);
            }
        }
    }
    Ok(())
}

/// Unpack `archive_path` into `dest_dir`.
///
/// A file that is not a recognised archive is copied in unchanged, keeping
/// its name. Disk images are left to the macOS applier.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> UpdateResult<()> {
    fs::create_dir_all(dest_dir).map_err(|e| {
        UpdateError::io("failed to create extraction directory", e)
            .with_context("path", dest_dir.display())
    })?;

    let kind = ArchiveKind::detect(archive_path);
    tracing::info!(archive = %archive_path.display(), kind = ?kind, dest = %dest_dir.display(), "Extracting update");

    let open = || {
        File::open(archive_path).map_err(|e| {
            UpdateError::io("failed to open archive", e).with_context("path", archive_path.display())
        })
    };

    match kind {
        ArchiveKind::Zip => extract_zip(archive_path, dest_dir),
        ArchiveKind::TarGz => {
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(open()?));
            safe_tar_unpack(&mut archive, dest_dir)
        }
        ArchiveKind::TarXz => {
            let mut archive = tar::Archive::new(xz2::read::XzDecoder::new(open()?));
            safe_tar_unpack(&mut archive, dest_dir)
        }
        ArchiveKind::Dmg => Err(UpdateError::validation("disk images can only be installed on macOS")
            .with_context("path", archive_path.display())),
        ArchiveKind::Raw => {
            let name = archive_path.file_name().ok_or_else(|| {
                UpdateError::validation("update file has no name")
                    .with_context("path", archive_path.display())
            })?;
            let out = dest_dir.join(name);
            fs::copy(archive_path, &out).map_err(|e| {
                UpdateError::io("failed to copy update file", e).with_context("path", out.display())
            })?;
            #[cfg(unix)]
            {
                set_mode(&out, 0o755);
            }
            Ok(())
        }
    }
}

/// Whether `path` is a regular file with any execute bit set.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Whether `path` is an `.exe` file.
#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

/// First executable in `dir`, visiting entries in file name order.
pub fn find_first_executable(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && is_executable(entry.path()))
        .map(|entry| entry.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_gz_with(dir: &Path, entries: &[(&str, &[u8], u32)]) -> PathBuf {
        let path = dir.join("update.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    /// Tar with a raw entry name, bypassing the builder's own path checks.
    fn tar_gz_with_raw_name(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join("evil.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"owned";
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_backup_path_for() {
        assert_eq!(
            backup_path_for(Path::new("/opt/app/bin/app")),
            PathBuf::from("/opt/app/bin/app.backup")
        );
    }

    #[test]
    fn test_archive_kind_detect() {
        assert_eq!(ArchiveKind::detect(Path::new("App.ZIP")), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::detect(Path::new("a.tar.gz")), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect(Path::new("a.tgz")), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect(Path::new("a.tar.xz")), ArchiveKind::TarXz);
        assert_eq!(ArchiveKind::detect(Path::new("a.dmg")), ArchiveKind::Dmg);
        assert_eq!(ArchiveKind::detect(Path::new("app-linux")), ArchiveKind::Raw);
    }

    #[test]
    fn test_validate_path_safe() {
        let dest = Path::new("/tmp/extract");
        assert_eq!(
            validate_path_safe(dest, "bin/app").unwrap(),
            PathBuf::from("/tmp/extract/bin/app")
        );
        assert_eq!(
            validate_path_safe(dest, "./app").unwrap(),
            PathBuf::from("/tmp/extract/app")
        );

        for bad in ["../../evil", "bin/../../evil", "/etc/passwd", "a\0b"] {
            let err = validate_path_safe(dest, bad).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Security, "{bad}");
        }
    }

    #[test]
    fn test_backup_and_restore_file() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("app");
        fs::write(&exe, b"original binary").unwrap();
        let backup_path = backup_path_for(&exe);

        backup(&exe, &backup_path).unwrap();
        fs::write(&exe, b"broken").unwrap();
        restore(&backup_path, &exe).unwrap();

        assert_eq!(fs::read(&exe).unwrap(), b"original binary");
    }

    #[test]
    fn test_backup_and_restore_directory() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("App.app");
        fs::create_dir_all(bundle.join("Contents/MacOS")).unwrap();
        fs::write(bundle.join("Contents/MacOS/App"), b"mach-o").unwrap();
        fs::write(bundle.join("Contents/Info.plist"), b"<plist/>").unwrap();
        let backup_path = backup_path_for(&bundle);

        backup(&bundle, &backup_path).unwrap();
        fs::remove_dir_all(&bundle).unwrap();
        restore(&backup_path, &bundle).unwrap();

        assert_eq!(fs::read(bundle.join("Contents/MacOS/App")).unwrap(), b"mach-o");
        assert_eq!(total_size(&bundle).unwrap(), 14);
    }

    #[test]
    fn test_backup_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = backup(&dir.path().join("missing"), &dir.path().join("b")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::FileSystem);
    }

    #[test]
    fn test_cleanup_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("leftover");
        let tree = dir.path().join("extract");
        fs::write(&file, b"x").unwrap();
        fs::create_dir_all(tree.join("nested")).unwrap();

        cleanup(&[file.clone(), tree.clone(), dir.path().join("never-existed")]).unwrap();
        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_tar_gz_keeps_modes() {
        let dir = TempDir::new().unwrap();
        let archive = tar_gz_with(
            dir.path(),
            &[("README.md", b"docs", 0o644), ("bin/app", b"\x7fELF....", 0o755)],
        );
        let dest = dir.path().join("out");

        extract_archive(&archive, &dest).unwrap();

        assert!(is_executable(&dest.join("bin/app")));
        assert!(!is_executable(&dest.join("README.md")));
        assert_eq!(find_first_executable(&dest), Some(dest.join("bin/app")));
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let archive = tar_gz_with_raw_name(dir.path(), "../../evil");
        let dest = dir.path().join("a").join("b");

        let err = extract_archive(&archive, &dest).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Security);
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn test_extract_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("update.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        writer.start_file("app/app", options).unwrap();
        writer.write_all(b"\x7fELF").unwrap();
        writer.finish().unwrap();
        let dest = dir.path().join("out");

        extract_archive(&path, &dest).unwrap();
        assert_eq!(fs::read(dest.join("app/app")).unwrap(), b"\x7fELF");
    }

    #[test]
    fn test_extract_zip_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evil.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        writer
            .start_file("../../evil", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"owned").unwrap();
        writer.finish().unwrap();

        let err = extract_archive(&path, &dir.path().join("a").join("b")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Security);
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn test_extract_corrupt_archive_is_filesystem_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("update.tar.gz");
        fs::write(&path, b"this is not gzip").unwrap();

        let err = extract_archive(&path, &dir.path().join("out")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::FileSystem);
    }

    #[test]
    fn test_extract_raw_file() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("app-linux-amd64");
        fs::write(&raw, b"\x7fELF").unwrap();
        let dest = dir.path().join("out");

        extract_archive(&raw, &dest).unwrap();
        assert!(dest.join("app-linux-amd64").is_file());
        #[cfg(unix)]
        assert_eq!(find_first_executable(&dest), Some(dest.join("app-linux-amd64")));
    }
}
