use futures::Stream;
use futures::TryStreamExt;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::models::{ApiConfig, PlanRequest, PlanResponse};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("API returned error: {0}")]
    ApiError(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct ApiClient {
    config: ApiConfig,
    client: Client,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    pub fn planner_url(&self) -> &str {
        &self.config.planner_url
    }

    /// Ask the planner how to group `request.files` into zip bundles.
    ///
    /// A non-2xx answer whose body is still a plan (typically carrying
    /// `internal_error` and diagnostics) is returned as a plan, not an error.
    pub async fn request_plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        debug!(
            "requesting bundle plan {} for {} files",
            request.bundle_base_name,
            request.files.len()
        );

        let response = self
            .client
            .post(&self.config.planner_url)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str::<PlanResponse>(&body) {
            Ok(plan) => Ok(plan),
            Err(_) if !status.is_success() => Err(ApiError::ApiError(format!(
                "Plan request failed with HTTP {}",
                status
            ))),
            Err(e) => Err(ApiError::InvalidResponse(format!(
                "JSON decode error: {}",
                e
            ))),
        }
    }

    /// Download a bundle with progress stream
    /// Returns (total_size, stream)
    pub async fn download_bundle_stream(
        &self,
        bundle_url: &str,
    ) -> Result<(Option<u64>, impl Stream<Item = Result<bytes::Bytes>>)> {
        let response = self
            .client
            .get(bundle_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ApiError::ApiError(format!("Download request failed: {}", e)))?;

        let total_size = response.content_length();
        let stream = response.bytes_stream().map_err(ApiError::RequestError);

        Ok((total_size, stream))
    }
}

/// Where one bundle is fetched from: `post_each_to` joined with the bundle name.
pub fn bundle_url(post_each_to: &str, bundle_name: &str) -> Result<Url> {
    let mut base = Url::parse(post_each_to)
        .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", post_each_to, e)))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(bundle_name)
        .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", bundle_name, e)))
}
