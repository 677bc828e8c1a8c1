//! Settings persistence (JSON)

use crate::error::{BundleError, BundleResult};
use bundlefetch_types::Settings;
use std::path::Path;

/// Load settings from a JSON file; missing fields take their defaults.
pub fn load_settings(path: &Path) -> BundleResult<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate(&settings)?;
    Ok(settings)
}

/// Write settings as pretty-printed JSON, creating parent directories.
pub fn save_settings(path: &Path, settings: &Settings) -> BundleResult<()> {
    validate(settings)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Reject settings the runtime cannot work with
pub fn validate(settings: &Settings) -> BundleResult<()> {
    if settings.cache_root.as_os_str().is_empty() {
        return Err(BundleError::Config("cache_root must not be empty".into()));
    }
    let per_step = [
        ("scan_entries_per_step", settings.scan_entries_per_step),
        ("verify_files_per_step", settings.verify_files_per_step),
        ("clear_files_per_step", settings.clear_files_per_step),
    ];
    for (name, value) in per_step {
        if value == 0 {
            return Err(BundleError::Config(format!("{} must be greater than 0", name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlefetch_types::VerifyLevel;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            cache_root: dir.path().join("cache"),
            verify_level: VerifyLevel::High,
            hard_fail_status: Some(500),
            ..Settings::default()
        };

        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path).unwrap();

        assert_eq!(loaded.cache_root, settings.cache_root);
        assert_eq!(loaded.verify_level, VerifyLevel::High);
        assert_eq!(loaded.hard_fail_status, Some(500));
    }

    #[test]
    fn test_zero_counts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "verify_files_per_step": 0 }"#).unwrap();

        assert!(matches!(load_settings(&path), Err(BundleError::Config(_))));
    }

    #[test]
    fn test_zero_time_slice_is_accepted() {
        let settings = Settings {
            time_slice_ms: 0,
            ..Settings::default()
        };
        assert!(validate(&settings).is_ok());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_settings(&path), Err(BundleError::Config(_))));
    }
}
