// Boundary to the remote bundling service: request, status branch, messages.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError, PlanRequest, PlanRequestFile, PlanResponse};
use crate::domain::{AppError, BundlePlan, CartItem, PlanDiagnostics, PlanStatus};
use crate::utils::get_timestamp;

#[async_trait]
pub trait PlanService: Send + Sync {
    async fn fetch_plan(&self, request: &PlanRequest) -> Result<PlanResponse, ApiError>;

    /// URL reported in diagnostics.
    fn endpoint(&self) -> String;
}

#[async_trait]
impl PlanService for ApiClient {
    async fn fetch_plan(&self, request: &PlanRequest) -> Result<PlanResponse, ApiError> {
        self.request_plan(request).await
    }

    fn endpoint(&self) -> String {
        self.planner_url().to_string()
    }
}

/// An accepted plan plus the warning text to show before downloading, if any.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: BundlePlan,
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct BundlePlanner {
    service: Arc<dyn PlanService>,
}

impl BundlePlanner {
    pub fn new(service: Arc<dyn PlanService>) -> Self {
        Self { service }
    }

    pub fn build_request(bundle_base_name: &str, items: &[CartItem]) -> PlanRequest {
        PlanRequest {
            bundle_base_name: bundle_base_name.to_string(),
            files: items
                .iter()
                .map(|item| PlanRequestFile {
                    file_path: item.key(),
                    download_url: item.download_url.clone(),
                })
                .collect(),
        }
    }

    /// `completed`/`warnings` yield a plan; `error`/`internal_error` and
    /// transport failures yield a plan-level error carrying diagnostics.
    pub async fn request_plan(
        &self,
        bundle_base_name: &str,
        items: &[CartItem],
    ) -> Result<PlanOutcome, AppError> {
        let request = Self::build_request(bundle_base_name, items);

        let response = match self.service.fetch_plan(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("bundle plan request failed: {}", e);
                return Err(AppError::PlanRequest {
                    message: e.to_string(),
                    diagnostics: self.local_diagnostics(&request, Some(e.to_string())),
                });
            }
        };

        let plan = BundlePlan::from(response);
        match plan.status {
            PlanStatus::Completed | PlanStatus::Warnings => {
                info!(
                    "bundle plan {}: {} bundles, {} files, {} bytes",
                    plan.status.as_str(),
                    plan.bundles.len(),
                    plan.files_count,
                    plan.size
                );
                let warning = warning_message(&plan);
                Ok(PlanOutcome { plan, warning })
            }
            PlanStatus::Error | PlanStatus::InternalError => {
                let message = error_message(&plan);
                warn!("bundle plan rejected ({}): {}", plan.status.as_str(), message);
                let diagnostics = plan
                    .diagnostics
                    .clone()
                    .unwrap_or_else(|| self.local_diagnostics(&request, Some(message.clone())));
                Err(AppError::PlanContent {
                    status: plan.status.as_str().to_string(),
                    message,
                    diagnostics: Some(diagnostics),
                })
            }
        }
    }

    fn local_diagnostics(&self, request: &PlanRequest, error: Option<String>) -> PlanDiagnostics {
        PlanDiagnostics {
            url: self.service.endpoint(),
            time: get_timestamp().to_string(),
            body: serde_json::to_string(request).unwrap_or_default(),
            error,
        }
    }
}

/// Text shown alongside a `warnings` plan. `None` for a clean `completed` plan.
pub fn warning_message(plan: &BundlePlan) -> Option<String> {
    if plan.status != PlanStatus::Warnings {
        return None;
    }
    let mut lines: Vec<String> = plan.messages.clone();
    if !plan.not_included.is_empty() {
        lines.push(format!(
            "{} file(s) not included: {}",
            plan.not_included.len(),
            plan.not_included.join(", ")
        ));
    }
    if lines.is_empty() {
        lines.push("Some files could not be bundled.".to_string());
    }
    Some(lines.join("\n"))
}

/// Text shown in the diagnostic panel for an `error`/`internal_error` plan.
pub fn error_message(plan: &BundlePlan) -> String {
    if plan.messages.is_empty() {
        format!("The bundling service reported {}", plan.status.as_str())
    } else {
        plan.messages.join("; ")
    }
}
