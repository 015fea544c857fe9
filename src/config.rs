use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain::AppError;

/// Default number of bundle transfers allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Registry key shared by every cart.
pub const DEFAULT_CART_STATUS_NAME: &str = "cartstatus";

/// Cart id that cleanup never removes.
pub const DEFAULT_GLOBAL_CART_ID: &str = "global";

/// Top-level configuration for the cart and downloader.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Bundle-planning endpoint (POST).
    pub planner_url: String,
    /// Maximum number of concurrent bundle transfers.
    pub max_concurrent_downloads: usize,
    /// Storage key of the cross-cart status registry.
    pub cart_status_name: String,
    /// Reserved cart id that is never garbage-collected.
    pub global_cart_id: String,
    /// Directory backing `FileStorage`.
    pub storage_dir: PathBuf,
    /// Directory bundle archives are written to.
    pub download_dir: PathBuf,
    /// Prefix for randomized bundle base names.
    pub bundle_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            planner_url: "http://localhost:8080/api/bundle".to_string(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            cart_status_name: DEFAULT_CART_STATUS_NAME.to_string(),
            global_cart_id: DEFAULT_GLOBAL_CART_ID.to_string(),
            storage_dir: PathBuf::from("./.bundle-cart"),
            download_dir: PathBuf::from("./downloads"),
            bundle_prefix: "bundle".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Self::from_json(&content)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> Result<Self, AppError> {
        let mut config: AppConfig =
            serde_json::from_str(content).map_err(|e| AppError::Config(e.to_string()))?;
        config.max_concurrent_downloads = config.max_concurrent_downloads.max(1);
        Ok(config)
    }
}
