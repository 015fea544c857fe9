use serde::{Deserialize, Serialize};

use crate::domain::{Bundle, BundlePlan, PlanDiagnostics, PlanStatus};

/// Body of the bundle-planning POST
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub bundle_base_name: String,
    pub files: Vec<PlanRequestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequestFile {
    pub file_path: String,
    pub download_url: String,
}

/// Response from the bundle-planning endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub status: PlanStatus,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub not_included: Vec<String>,
    #[serde(default)]
    pub bundle_name_file_path_url: Vec<Bundle>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub files_count: u64,
    #[serde(default)]
    pub post_each_to: String,
    #[serde(default)]
    pub diagnostics: Option<PlanDiagnostics>,
}

impl From<PlanResponse> for BundlePlan {
    fn from(response: PlanResponse) -> Self {
        Self {
            status: response.status,
            bundles: response.bundle_name_file_path_url,
            size: response.size,
            files_count: response.files_count,
            post_each_to: response.post_each_to,
            messages: response.messages,
            not_included: response.not_included,
            diagnostics: response.diagnostics,
        }
    }
}

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub planner_url: String,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            planner_url: "http://localhost:8080/api/bundle".to_string(),
            user_agent: concat!("bundle-cart/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
