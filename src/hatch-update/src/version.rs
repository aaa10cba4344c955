//! Version comparison and build environment detection.

use std::cmp::Ordering;
use std::fmt;

use semver::Version;

use crate::config::{CheckFrequency, UpdateConfig};
use crate::error::{UpdateError, UpdateResult};

/// Version string reported by builds without release metadata.
pub const DEV_VERSION: &str = "(dev)";

/// Strip a single leading `v` from a version string.
pub fn normalize_version(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

/// Check whether a string is strict semver after `v`-prefix normalization.
pub fn is_valid_semver(version: &str) -> bool {
    Version::parse(normalize_version(version)).is_ok()
}

/// Parse a version, naming which side failed in the error.
fn parse_side(version: &str, side: &str) -> UpdateResult<Version> {
    Version::parse(normalize_version(version)).map_err(|e| {
        UpdateError::validation(format!("invalid {side} version format"))
            .with_cause(e)
            .with_context(format!("{side}_version"), version)
    })
}

/// Compare by semver precedence: build metadata is ignored and a pre-release
/// sorts below its release.
fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch, &a.pre).cmp(&(b.major, b.minor, b.patch, &b.pre))
}

/// Returns true when `latest` is strictly newer than `current`.
pub fn compare_versions(current: &str, latest: &str) -> UpdateResult<bool> {
    let current = parse_side(current, "current")?;
    let latest = parse_side(latest, "latest")?;
    Ok(precedence(&latest, &current) == Ordering::Greater)
}

/// Whether the running build is a release build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Development for empty, `(dev)`, `unknown`, or any non-semver version.
    pub fn detect(version: &str) -> Self {
        if version.is_empty() || version == DEV_VERSION || version == "unknown" {
            return Self::Development;
        }
        if is_valid_semver(version) {
            Self::Production
        } else {
            Self::Development
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the host should drive update checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Disabled,
    Manual,
    Automatic,
    Development,
}

impl UpdateMode {
    pub fn determine(env: Environment, config: &UpdateConfig) -> Self {
        if !config.enabled {
            return Self::Disabled;
        }
        match env {
            Environment::Development => {
                if config.dev_mode_enabled {
                    Self::Development
                } else {
                    Self::Manual
                }
            }
            Environment::Production => match config.check_frequency {
                CheckFrequency::Startup | CheckFrequency::Daily | CheckFrequency::Weekly => {
                    Self::Automatic
                }
                CheckFrequency::Manual | CheckFrequency::Unknown(_) => Self::Manual,
            },
        }
    }

    pub fn should_check_at_startup(&self) -> bool {
        matches!(self, Self::Automatic | Self::Development)
    }

    pub fn is_enabled(&self) -> bool {
        *self != Self::Disabled
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Manual => "manual",
            Self::Automatic => "automatic",
            Self::Development => "development",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version of the running build together with its derived mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Version with any leading `v` removed
    pub version: String,
    pub raw_version: String,
    pub environment: Environment,
    pub update_mode: UpdateMode,
}

impl VersionInfo {
    pub fn new(version: &str, config: &UpdateConfig) -> Self {
        let environment = Environment::detect(version);
        Self {
            version: normalize_version(version).to_string(),
            raw_version: version.to_string(),
            environment,
            update_mode: UpdateMode::determine(environment, config),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    /// Regular checks run only for release builds with updates enabled.
    pub fn can_check_updates(&self) -> bool {
        self.update_mode.is_enabled() && !self.is_development()
    }

    /// Development builds with dev mode on check regardless of schedule.
    pub fn should_force_update_check(&self) -> bool {
        self.is_development() && self.update_mode == UpdateMode::Development
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_compare_versions() {
        assert!(compare_versions("1.2.3", "1.2.4").unwrap());
        assert!(!compare_versions("2.0.0", "1.9.9").unwrap());
        assert!(compare_versions("1.0.0-beta", "1.0.0").unwrap());
        assert!(!compare_versions("1.0.0", "1.0.0").unwrap());
        assert!(compare_versions("1.9.0", "1.10.0").unwrap());
    }

    #[test]
    fn test_compare_versions_strips_v_prefix() {
        assert!(compare_versions("v1.0.0", "v1.1.0").unwrap());
        assert!(compare_versions("1.0.0", "v1.1.0").unwrap());
    }

    #[test]
    fn test_compare_versions_is_antisymmetric() {
        let pairs = [
            ("1.0.0", "1.0.1"),
            ("1.0.0-alpha", "1.0.0-alpha.1"),
            ("1.0.0-alpha.1", "1.0.0-beta"),
            ("0.9.9", "1.0.0"),
        ];
        for (a, b) in pairs {
            assert!(compare_versions(a, b).unwrap(), "{a} < {b}");
            assert!(!compare_versions(b, a).unwrap(), "{b} > {a}");
        }
    }

    #[test]
    fn test_build_metadata_ignored() {
        assert!(!compare_versions("1.0.0+build.1", "1.0.0+build.2").unwrap());
        assert!(!compare_versions("1.0.0+build.2", "1.0.0+build.1").unwrap());
    }

    #[test]
    fn test_invalid_version_names_side() {
        let err = compare_versions("not-a-version", "1.0.0").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(err.message(), "invalid current version format");
        assert_eq!(err.context_value("current_version"), Some("not-a-version"));

        let err = compare_versions("1.0.0", "1.0").unwrap_err();
        assert_eq!(err.message(), "invalid latest version format");
        assert_eq!(err.context_value("latest_version"), Some("1.0"));
    }

    #[test]
    fn test_environment_detect() {
        assert_eq!(Environment::detect(""), Environment::Development);
        assert_eq!(Environment::detect(DEV_VERSION), Environment::Development);
        assert_eq!(Environment::detect("unknown"), Environment::Development);
        assert_eq!(Environment::detect("nightly"), Environment::Development);
        assert_eq!(Environment::detect("v1.2.3"), Environment::Production);
    }

    #[test]
    fn test_update_mode_determine() {
        let mut config = UpdateConfig::default();
        assert_eq!(
            UpdateMode::determine(Environment::Production, &config),
            UpdateMode::Automatic
        );

        config.check_frequency = CheckFrequency::Manual;
        assert_eq!(
            UpdateMode::determine(Environment::Production, &config),
            UpdateMode::Manual
        );

        assert_eq!(
            UpdateMode::determine(Environment::Development, &config),
            UpdateMode::Manual
        );
        config.dev_mode_enabled = true;
        assert_eq!(
            UpdateMode::determine(Environment::Development, &config),
            UpdateMode::Development
        );

        config.enabled = false;
        assert_eq!(
            UpdateMode::determine(Environment::Production, &config),
            UpdateMode::Disabled
        );
    }

    #[test]
    fn test_version_info() {
        let info = VersionInfo::new("v1.4.0", &UpdateConfig::default());
        assert_eq!(info.version, "1.4.0");
        assert!(info.can_check_updates());
        assert!(!info.should_force_update_check());

        let info = VersionInfo::new(DEV_VERSION, &UpdateConfig::development());
        assert!(info.is_development());
        assert!(!info.can_check_updates());
        assert!(info.should_force_update_check());
    }
}
