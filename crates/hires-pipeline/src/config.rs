//! Service configuration.
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! `HIRES_*` environment variables.  Command-line flags are applied last by
//! the caller.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use hires_core::error::{HiresError, Result};
use hires_core::types::DeviceKind;

/// Moves all three artifact roots under one directory.
pub const ROOT_ENV: &str = "HIRES_ROOT";
pub const WEIGHTS_DIR_ENV: &str = "HIRES_WEIGHTS_DIR";
pub const WEIGHTS_URL_ENV: &str = "HIRES_WEIGHTS_URL";
pub const DEVICE_ENV: &str = hires_core::device::DEVICE_ENV;
pub const TILE_WINDOW_ENV: &str = "HIRES_TILE_WINDOW";

const UPLOAD_DIR_NAME: &str = "image_upscaler_uploads";
const RESULT_DIR_NAME: &str = "image_upscaler_results";

/// Per-request admission limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Files accepted in one batch.
    pub max_files: usize,
    /// Largest single upload, in bytes.
    pub max_file_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_files: 50,
            max_file_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Parent of per-session upload directories.
    pub upload_root: PathBuf,
    /// Parent of per-session result directories.
    pub result_root: PathBuf,
    /// Directory holding `upscaled_<id>.zip` archives.
    pub archive_root: PathBuf,
    /// Local weights cache, `<weights_dir>/<variant>.onnx`.
    pub weights_dir: PathBuf,
    /// Remote weights location, `<weights_base_url>/<variant>.onnx`.
    pub weights_base_url: Option<String>,
    /// Forced compute device; `None` probes the host.
    pub device: Option<DeviceKind>,
    pub limits: Limits,
    /// Tile window used when an untiled run exhausts memory.
    pub tile_window: u32,
    /// Lossy encoder quality (JPEG).
    pub quality: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::with_root(&env::temp_dir())
    }
}

impl ServiceConfig {
    /// Defaults with every artifact root placed under `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            upload_root: root.join(UPLOAD_DIR_NAME),
            result_root: root.join(RESULT_DIR_NAME),
            archive_root: root.to_path_buf(),
            weights_dir: PathBuf::from("weights"),
            weights_base_url: None,
            device: None,
            limits: Limits::default(),
            tile_window: 256,
            quality: 95,
        }
    }

    /// Defaults, overlaid by `path` (if any), overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| HiresError::io(path, e))?;
        serde_json::from_str(&raw)
            .map_err(|e| HiresError::Config(format!("{}: {e}", path.display())))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|key| env::var(key).ok())
    }

    /// Apply `HIRES_*` overrides read through `lookup`.  Empty values are ignored.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(root) = get(ROOT_ENV) {
            let root = PathBuf::from(root);
            self.upload_root = root.join(UPLOAD_DIR_NAME);
            self.result_root = root.join(RESULT_DIR_NAME);
            self.archive_root = root;
        }
        if let Some(dir) = get(WEIGHTS_DIR_ENV) {
            self.weights_dir = PathBuf::from(dir);
        }
        if let Some(url) = get(WEIGHTS_URL_ENV) {
            self.weights_base_url = Some(url);
        }
        if let Some(device) = get(DEVICE_ENV) {
            self.device = hires_core::device::device_override(Some(device.as_str()));
        }
        if let Some(window) = get(TILE_WINDOW_ENV) {
            self.tile_window = window.trim().parse().map_err(|_| {
                HiresError::Config(format!("{TILE_WINDOW_ENV} must be a positive integer, got '{window}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_window == 0 {
            return Err(HiresError::Config("tile_window must be greater than 0".into()));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(HiresError::Config(format!(
                "quality must be within 1..=100, got {}",
                self.quality
            )));
        }
        if self.limits.max_files == 0 {
            return Err(HiresError::Config("limits.max_files must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_service_limits() {
        let config = ServiceConfig::default();
        assert_eq!(config.limits.max_files, 50);
        assert_eq!(config.limits.max_file_bytes, 20 * 1024 * 1024);
        assert_eq!(config.tile_window, 256);
        assert_eq!(config.quality, 95);
        assert!(config.upload_root.ends_with("image_upscaler_uploads"));
        assert!(config.result_root.ends_with("image_upscaler_results"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply_over_file_values() {
        let mut config = ServiceConfig::with_root(Path::new("/srv/a"));
        config
            .apply_overrides_with(lookup(&[
                (ROOT_ENV, "/srv/b"),
                (WEIGHTS_URL_ENV, "https://models.invalid/sr/"),
                (DEVICE_ENV, "cpu"),
                (TILE_WINDOW_ENV, "128"),
                (WEIGHTS_DIR_ENV, ""),
            ]))
            .unwrap();
        assert_eq!(config.result_root, Path::new("/srv/b/image_upscaler_results"));
        assert_eq!(config.archive_root, Path::new("/srv/b"));
        assert_eq!(config.device, Some(DeviceKind::Cpu));
        assert_eq!(config.tile_window, 128);
        assert_eq!(config.weights_dir, Path::new("weights"));
        assert_eq!(config.weights_base_url.as_deref(), Some("https://models.invalid/sr/"));
    }

    #[test]
    fn bad_tile_window_is_config_error() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_overrides_with(lookup(&[(TILE_WINDOW_ENV, "big")]))
            .expect_err("non-numeric window must fail");
        assert!(matches!(err, HiresError::Config(msg) if msg.contains(TILE_WINDOW_ENV)));
    }

    #[test]
    fn json_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hires.json");
        fs::write(&path, r#"{ "quality": 80, "limits": { "max_files": 5 } }"#).unwrap();
        let config = ServiceConfig::from_json_file(&path).unwrap();
        assert_eq!(config.quality, 80);
        assert_eq!(config.limits.max_files, 5);
        assert_eq!(config.limits.max_file_bytes, 20 * 1024 * 1024);
        assert_eq!(config.tile_window, 256);
    }

    #[test]
    fn unknown_json_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hires.json");
        fs::write(&path, r#"{ "qualty": 80 }"#).unwrap();
        let err = ServiceConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, HiresError::Config(_)));
    }

    #[test]
    fn validation_rejects_out_of_range_quality() {
        let config = ServiceConfig {
            quality: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
