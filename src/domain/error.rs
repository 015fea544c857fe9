use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Context captured around a failed bundle-planning request, shown to the user
/// in the diagnostic panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDiagnostics {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl fmt::Display for PlanDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "url={} time={}", self.url, self.time)?;
        if let Some(error) = &self.error {
            write!(f, " error={}", error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Transport failure while asking the planner for a plan.
    #[error("Bundle plan request failed: {message}")]
    PlanRequest {
        message: String,
        diagnostics: PlanDiagnostics,
    },

    /// The planner answered, but with `error` or `internal_error`.
    #[error("Bundle planning failed ({status}): {message}")]
    PlanContent {
        status: String,
        message: String,
        diagnostics: Option<PlanDiagnostics>,
    },

    /// One bundle's transfer failed. Never terminal for the workflow.
    #[error("Download of bundle {bundle} failed: {message}")]
    Download { bundle: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid workflow state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Diagnostics attached to plan-level failures, if any.
    pub fn diagnostics(&self) -> Option<&PlanDiagnostics> {
        match self {
            AppError::PlanRequest { diagnostics, .. } => Some(diagnostics),
            AppError::PlanContent { diagnostics, .. } => diagnostics.as_ref(),
            _ => None,
        }
    }

    /// Plan-level errors end the current workflow instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppError::PlanRequest { .. } | AppError::PlanContent { .. }
        )
    }
}

impl From<crate::storage::StorageError> for AppError {
    fn from(err: crate::storage::StorageError) -> Self {
        AppError::Storage(err.to_string())
    }
}
