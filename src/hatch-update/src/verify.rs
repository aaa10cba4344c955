//! SHA256 verification and executable format checks.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{UpdateError, UpdateResult};

const BUFFER_SIZE: usize = 8192;

/// Executable headers accepted after an install: PE, ELF, Mach-O thin and fat.
const EXECUTABLE_MAGIC: &[(&[u8], &str)] = &[
    (b"MZ", "pe"),
    (b"\x7fELF", "elf"),
    (&[0xfe, 0xed, 0xfa, 0xce], "mach-o"),
    (&[0xfe, 0xed, 0xfa, 0xcf], "mach-o"),
    (&[0xce, 0xfa, 0xed, 0xfe], "mach-o"),
    (&[0xcf, 0xfa, 0xed, 0xfe], "mach-o"),
    (&[0xca, 0xfe, 0xba, 0xbe], "mach-o-universal"),
    (&[0xbe, 0xba, 0xfe, 0xca], "mach-o-universal"),
];

/// Calculate SHA256 hash of a file as lowercase hex.
pub async fn calculate_sha256(path: &Path) -> UpdateResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UpdateError::io("failed to open file for hashing", e).with_context("path", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| UpdateError::io("failed to read file for hashing", e).with_context("path", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Blocking variant for use inside appliers.
pub fn calculate_sha256_sync(path: &Path) -> UpdateResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| UpdateError::io("failed to open file for hashing", e).with_context("path", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| UpdateError::io("failed to read file for hashing", e).with_context("path", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare hex digests ignoring surrounding whitespace and case.
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Verify SHA256 checksum of a file.
pub async fn verify_sha256(path: &Path, expected: &str) -> UpdateResult<()> {
    let actual = calculate_sha256(path).await?;
    if !checksums_match(expected, &actual) {
        return Err(UpdateError::validation("checksum mismatch")
            .with_context("expected", expected.trim().to_lowercase())
            .with_context("actual", actual)
            .with_context("path", path.display()));
    }
    Ok(())
}

/// Check that `path` starts with a known executable header.
pub fn validate_executable(path: &Path) -> UpdateResult<()> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        UpdateError::io("failed to open executable for validation", e)
            .with_context("path", path.display())
    })?;

    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(UpdateError::io("failed to read executable header", e)
                    .with_context("path", path.display()));
            }
        }
    }
    let header = &header[..filled];

    match EXECUTABLE_MAGIC
        .iter()
        .find(|(magic, _)| header.starts_with(magic))
    {
        Some((_, format)) => {
            tracing::debug!(path = %path.display(), format, "Executable header validated");
            Ok(())
        }
        None => Err(UpdateError::security("file is not a recognized executable format")
            .with_context("path", path.display())
            .with_context("header", hex::encode(header))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[tokio::test]
    async fn test_verify_sha256() {
        let file = file_with(b"hello world");
        verify_sha256(file.path(), HELLO_SHA256).await.unwrap();
        verify_sha256(file.path(), &format!("  {}\n", HELLO_SHA256.to_uppercase()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_sha256_mismatch() {
        let file = file_with(b"hello world");
        let wrong = "0".repeat(64);

        let err = verify_sha256(file.path(), &wrong).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(err.context_value("actual"), Some(HELLO_SHA256));
    }

    #[test]
    fn test_calculate_sha256() {
        let file = file_with(b"hello world");
        let digest = tokio_test::block_on(calculate_sha256(file.path())).unwrap();
        assert_eq!(digest, HELLO_SHA256);
        assert_eq!(calculate_sha256_sync(file.path()).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_validate_executable_headers() {
        for header in [
            &b"MZ\x90\x00"[..],
            b"\x7fELF\x02\x01",
            &[0xcf, 0xfa, 0xed, 0xfe, 0x07],
            &[0xca, 0xfe, 0xba, 0xbe, 0x00],
        ] {
            let file = file_with(header);
            validate_executable(file.path()).unwrap();
        }
    }

    #[test]
    fn test_validate_executable_rejects_scripts() {
        let file = file_with(b"#!/bin/sh\necho hi\n");
        let err = validate_executable(file.path()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Security);

        let empty = file_with(b"");
        assert!(validate_executable(empty.path()).is_err());
    }
}
