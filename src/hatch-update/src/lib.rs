//! Hatch Update - Auto-update system for desktop applications
//!
//! Provides update checking and installation via:
//! - GitHub releases and plain HTTP JSON manifests, tried in priority order
//! - A TTL-bounded check cache and persisted skip/schedule state
//! - Resumable HTTPS downloads with SHA-256 verification
//! - Per-platform installation with backup and automatic rollback
//!
//! # Example
//!
//! ```rust,ignore
//! use hatch_update::{AppUpdater, UpdaterOptions, UpdateConfig, UpdateSource};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut config = UpdateConfig::default();
//! config.sources.push(UpdateSource::github("hatch-app/hatch", 1));
//!
//! let mut updater = AppUpdater::new(UpdaterOptions {
//!     config,
//!     current_version: Some(env!("CARGO_PKG_VERSION").to_string()),
//!     ..Default::default()
//! })?;
//!
//! let cancel = CancellationToken::new();
//! let release = updater.check(&cancel).await?;
//! if release.is_newer {
//!     let path = updater.download(&release, &cancel, |p| println!("{:.0}%", p.percentage)).await?;
//!     updater.apply(&path).await?;
//!     updater.restart(&["--update".to_string()])?;
//! }
//! ```

pub mod apply;
pub mod cache;
pub mod checker;
pub mod config;
pub mod download;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod release;
pub mod state;
pub mod updater;
pub mod verify;
pub mod version;

pub use apply::{ApplyOutcome, ApplyPhase, UpdateApplier, platform_applier};
pub use cache::{CacheEntry, CheckCache};
pub use checker::{GitHubChecker, HttpManifestChecker, ReleaseManifest, VersionChecker};
pub use config::{CheckFrequency, ReleaseChannel, SourceKind, UpdateConfig, UpdateSource};
pub use download::{DownloadOptions, DownloadProgress, DownloadRequest, Downloader};
pub use error::{ErrorCategory, UpdateError, UpdateResult};
pub use orchestrator::UpdateChecker;
pub use release::{ReleaseInfo, UpdateEvent, UpdateEventKind};
pub use state::UpdateState;
pub use updater::{AppUpdater, UpdaterOptions};
pub use version::{Environment, UpdateMode, VersionInfo, compare_versions};
