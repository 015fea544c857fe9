use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::PlanDiagnostics;

/// Per-file download state as persisted in a cart. The empty string is the
/// "never attempted" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    #[serde(rename = "", alias = "none")]
    None,
    Downloading,
    Downloaded,
    Canceled,
    Failed,
    Error,
}

/// One file entry in a cart, keyed by `resId/filePath`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub res_id: String,
    pub file_path: String,
    #[serde(rename = "downloadURL", default)]
    pub download_url: String,
    #[serde(default)]
    pub download_status: DownloadStatus,
    #[serde(default)]
    pub is_selected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Metadata this crate does not interpret, kept so saves do not drop it.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CartItem {
    pub fn key(&self) -> String {
        item_key(&self.res_id, &self.file_path)
    }
}

/// Composite cart key. A leading slash on `file_path` is not doubled.
pub fn item_key(res_id: &str, file_path: &str) -> String {
    format!("{}/{}", res_id, file_path.trim_start_matches('/'))
}

/// Fields supplied to `Cart::add_file`. `None` fields leave an existing
/// entry's value in place.
#[derive(Debug, Clone, Default)]
pub struct FileData {
    pub file_path: String,
    pub download_url: String,
    pub download_status: Option<DownloadStatus>,
    pub size: Option<u64>,
    pub media_type: Option<String>,
    pub description: Option<String>,
    pub res_title: Option<String>,
    pub message: Option<String>,
}

impl FileData {
    pub fn new(file_path: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            download_url: download_url.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_status(mut self, status: DownloadStatus) -> Self {
        self.download_status = Some(status);
        self
    }

    pub fn with_res_title(mut self, title: impl Into<String>) -> Self {
        self.res_title = Some(title.into());
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// Registry row describing one cart's visibility and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartStatusEntry {
    pub item_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub is_in_use: bool,
    #[serde(default)]
    pub download_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,
}

impl CartStatusEntry {
    pub fn new(item_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            display_name: display_name.into(),
            is_in_use: false,
            download_percentage: 0.0,
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Completed,
    Warnings,
    Error,
    InternalError,
}

impl PlanStatus {
    pub fn is_success(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Warnings)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Completed => "completed",
            PlanStatus::Warnings => "warnings",
            PlanStatus::Error => "error",
            PlanStatus::InternalError => "internal_error",
        }
    }
}

/// A file reference inside a bundle: either the plain path string or the
/// `{filePath, downloadUrl}` object the request carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncludedFile {
    Path(String),
    #[serde(rename_all = "camelCase")]
    Entry {
        file_path: String,
        #[serde(default)]
        download_url: String,
    },
}

impl IncludedFile {
    pub fn file_path(&self) -> &str {
        match self {
            IncludedFile::Path(path) => path,
            IncludedFile::Entry { file_path, .. } => file_path,
        }
    }

    pub fn download_url(&self) -> Option<&str> {
        match self {
            IncludedFile::Entry { download_url, .. } if !download_url.is_empty() => {
                Some(download_url)
            }
            _ => None,
        }
    }
}

impl From<&str> for IncludedFile {
    fn from(path: &str) -> Self {
        IncludedFile::Path(path.to_string())
    }
}

impl From<String> for IncludedFile {
    fn from(path: String) -> Self {
        IncludedFile::Path(path)
    }
}

/// One archive the planner decided to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub bundle_name: String,
    #[serde(default)]
    pub include_files: Vec<IncludedFile>,
    #[serde(default)]
    pub bundle_size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundlePlan {
    pub status: PlanStatus,
    pub bundles: Vec<Bundle>,
    pub size: u64,
    pub files_count: u64,
    pub post_each_to: String,
    pub messages: Vec<String>,
    pub not_included: Vec<String>,
    pub diagnostics: Option<PlanDiagnostics>,
}

/// Lifecycle of one zip download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Downloading,
    Downloaded,
    Canceled,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Downloaded | TaskStatus::Canceled | TaskStatus::Error
        )
    }
}

/// Orchestrator workflow phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    PlanRequested,
    PlanReady,
    Downloading,
    Completed,
    Canceled,
}
