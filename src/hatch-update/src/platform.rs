//! Platform keys used to pick release assets.

/// Archive and image formats the appliers know how to install.
pub const INSTALLABLE_EXTENSIONS: &[&str] = &[".zip", ".tar.gz", ".tgz", ".tar.xz", ".dmg"];

/// OS name in release-asset naming (`darwin`, `linux`, `windows`).
pub fn os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Architecture name in release-asset naming (`amd64`, `arm64`, `386`, `arm`).
pub fn arch_name() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// Get the current platform key, e.g. `linux_amd64` or `darwin_arm64`.
pub fn platform_key() -> String {
    format!("{}_{}", os_name(), arch_name())
}

/// The key plus the alternative spellings release pipelines commonly use.
pub fn platform_key_aliases(key: &str) -> Vec<String> {
    let mut keys = vec![key.to_string()];
    if let Some(os) = key.strip_suffix("_amd64") {
        keys.push(format!("{os}_x86_64"));
    } else if let Some(os) = key.strip_suffix("_x86_64") {
        keys.push(format!("{os}_amd64"));
    } else if let Some(os) = key.strip_suffix("_arm64") {
        keys.push(format!("{os}_aarch64"));
    } else if let Some(os) = key.strip_suffix("_aarch64") {
        keys.push(format!("{os}_arm64"));
    }
    keys
}

/// Whether a file name ends in a format the appliers can install.
pub fn is_installable_asset(name: &str) -> bool {
    let lower = name.to_lowercase();
    INSTALLABLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Whether an asset name targets `key` (or one of its aliases) and is installable.
pub fn asset_matches_platform(name: &str, key: &str) -> bool {
    let lower = name.to_lowercase();
    is_installable_asset(name)
        && platform_key_aliases(key)
            .iter()
            .any(|alias| lower.contains(alias.as_str()))
}
