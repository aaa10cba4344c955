//! Integration tests for the updater facade: check → skip/up-to-date → apply → rollback.
//!
//! Tests drive `AppUpdater` through its public API against local mock servers
//! and temporary install directories.

use std::path::PathBuf;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hatch_update::platform::platform_key;
use hatch_update::{
    AppUpdater, ErrorCategory, UpdateConfig, UpdateSource, UpdateState, UpdaterOptions,
};

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Install {
    dir: TempDir,
    exec: PathBuf,
}

impl Install {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let exec = dir.path().join("app");
        std::fs::write(&exec, b"\x7fELF installed build").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exec, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        Self { dir, exec }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.path().join("state").join("update_state.json")
    }

    fn updater(&self, config: UpdateConfig, current_version: &str) -> AppUpdater {
        init_tracing();
        AppUpdater::new(UpdaterOptions {
            config,
            current_version: Some(current_version.to_string()),
            state_path: Some(self.state_path()),
            exec_path: Some(self.exec.clone()),
            download_dir: Some(self.dir.path().join("downloads")),
        })
        .unwrap()
    }
}

fn manifest_json(version: &str) -> serde_json::Value {
    serde_json::json!({
        "version": version,
        "published_at": "2024-05-01T12:00:00Z",
        "release_notes": "Bug fixes",
        "assets": {
            platform_key(): {
                "url": "https://downloads.example.com/app.tar.gz",
                "size": 1024,
                "checksum": "ab".repeat(32),
                "name": format!("app_{}.tar.gz", platform_key()),
            }
        }
    })
}

/// GitHub source that always fails, followed by a manifest source.
async fn mirrored_config(server: &MockServer, version: &str) -> UpdateConfig {
    Mock::given(method("GET"))
        .and(path("/repos/acme/app/releases/latest"))
        .respond_with(ResponseTemplate::new(500))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest_json(version)))
        .expect(1)
        .mount(server)
        .await;

    let mut github = UpdateSource::github("acme/app", 1);
    github.api_base_url = Some(server.uri());
    let mut mirror = UpdateSource::http(format!("{}/manifest.json", server.uri()), 2);
    mirror.need_check_checksum = true;

    UpdateConfig {
        sources: vec![mirror, github],
        ..UpdateConfig::default()
    }
}

// =============================================================================
// Checking
// =============================================================================

#[tokio::test]
async fn test_falls_back_to_manifest_and_caches_result() {
    let server = MockServer::start().await;
    let config = mirrored_config(&server, "v2.0.0").await;
    let install = Install::new();
    let mut updater = install.updater(config, "1.0.0");
    let cancel = CancellationToken::new();

    let release = updater.check(&cancel).await.unwrap();
    assert_eq!(release.version, "2.0.0");
    assert!(release.is_newer);
    assert!(release.needs_checksum_check);
    assert_eq!(release.checksum.as_deref(), Some("ab".repeat(32).as_str()));
    assert_eq!(updater.latest_release(), Some(&release));

    // Served from the cache; the manifest mock expects exactly one hit
    let cached = updater.check(&cancel).await.unwrap();
    assert_eq!(cached.version, "2.0.0");
    assert!(install.dir.path().join("state").join("update_cache.json").exists());
}

#[tokio::test]
async fn test_up_to_date_installs_nothing() {
    let server = MockServer::start().await;
    let config = mirrored_config(&server, "2.0.0").await;
    let install = Install::new();
    let mut updater = install.updater(config, "2.0.0");

    let installed = updater
        .perform_update(&CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(installed.is_none());
    assert!(updater.downloaded_path().is_none());
    assert_eq!(std::fs::read(&install.exec).unwrap(), b"\x7fELF installed build");
}

#[tokio::test]
async fn test_skipped_version_is_not_installed() {
    let server = MockServer::start().await;
    let config = mirrored_config(&server, "2.0.0").await;
    let install = Install::new();
    let mut updater = install.updater(config, "1.0.0");
    updater.skip_version("2.0.0").unwrap();

    let installed = updater
        .perform_update(&CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(installed.is_none());
    assert!(updater.downloaded_path().is_none());
    let state = UpdateState::load(&install.state_path());
    assert!(state.skipped_versions.contains("2.0.0"));
}

#[tokio::test]
async fn test_all_sources_failing_reports_network_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut github = UpdateSource::github("acme/app", 1);
    github.api_base_url = Some(server.uri());
    let config = UpdateConfig {
        sources: vec![github, UpdateSource::http(format!("{}/manifest.json", server.uri()), 2)],
        ..UpdateConfig::default()
    };
    let install = Install::new();
    let mut updater = install.updater(config, "1.0.0");

    let err = updater.check_force(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Network);
    assert_eq!(err.context_value("source_count"), Some("2"));
    assert!(updater.latest_release().is_none());
}

// =============================================================================
// Applying (plain executables)
// =============================================================================

#[cfg(unix)]
fn tar_gz(dir: &std::path::Path, entry: &str, content: &[u8]) -> PathBuf {
    let archive = dir.join("update.tar.gz");
    let encoder = flate2::write::GzEncoder::new(
        std::fs::File::create(&archive).unwrap(),
        flate2::Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, entry, content).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
    archive
}

#[cfg(unix)]
#[tokio::test]
async fn test_apply_archive_replaces_executable() {
    let install = Install::new();
    let update = tar_gz(install.dir.path(), "app-2.0.0/app", b"\x7fELF new build");
    let mut updater = install.updater(UpdateConfig::default(), "1.0.0");

    let outcome = updater.apply(&update).await.unwrap();

    assert_eq!(outcome, hatch_update::ApplyOutcome::Replaced);
    assert_eq!(std::fs::read(&install.exec).unwrap(), b"\x7fELF new build");
    assert!(!hatch_update::apply::base::backup_path_for(&install.exec).exists());
    assert!(!update.exists());
    assert!(UpdateState::load(&install.state_path()).last_update_time.is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn test_corrupt_archive_leaves_installation_untouched() {
    let install = Install::new();
    let update = install.dir.path().join("update.tar.gz");
    std::fs::write(&update, b"this is not a gzip stream").unwrap();
    let mut updater = install.updater(UpdateConfig::default(), "1.0.0");

    let err = updater.apply(&update).await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::FileSystem);
    assert!(!err.is_inconsistent_state());
    assert_eq!(std::fs::read(&install.exec).unwrap(), b"\x7fELF installed build");
    assert!(!hatch_update::apply::base::backup_path_for(&install.exec).exists());
    assert!(UpdateState::load(&install.state_path()).last_update_time.is_none());
}
