pub mod client;
pub mod models;

pub use client::{bundle_url, ApiClient, ApiError, Result};
pub use models::{ApiConfig, PlanRequest, PlanRequestFile, PlanResponse};
