//! Client for the log analysis service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AnalysisError;

/// Outcome of analyzing one log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: String,
    pub log_id: String,
    pub is_anomaly: bool,
    /// Anomaly score in `[0, 1]`.
    pub anomaly_score: f64,
    #[serde(default)]
    pub root_causes: serde_json::Value,
    #[serde(default)]
    pub recommendations: serde_json::Value,
    pub analyzed_at: DateTime<Utc>,
}

/// Service that turns log ids into analysis results.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Analyzes the given log records.
    ///
    /// Ids the backend cannot find are skipped; an empty result means none
    /// were found.
    async fn analyze(&self, log_ids: &[String]) -> Result<Vec<AnalysisResult>, AnalysisError>;
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    log_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    results: Vec<AnalysisResult>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(alias = "detail")]
    error: String,
}

/// JSON-over-HTTP analysis backend.
///
/// Sends `POST {base_url}/analyze` with `{"log_ids": [...]}` and expects
/// `{"results": [...]}` back.
#[derive(Debug, Clone)]
pub struct HttpAnalysisBackend {
    base_url: String,
    http_client: Client,
}

impl HttpAnalysisBackend {
    /// Creates a backend for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::InvalidConfig` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn analyze(&self, log_ids: &[String]) -> Result<Vec<AnalysisResult>, AnalysisError> {
        let url = format!("{}/analyze", self.base_url);

        let http_response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&AnalyzeRequest { log_ids })
            .send()
            .await
            .map_err(|e| AnalysisError::RequestFailed(e.to_string()))?;

        let status = http_response.status();

        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|body| body.error)
                .unwrap_or(error_text);

            return Err(AnalysisError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let response: AnalyzeResponse = http_response
            .json()
            .await
            .map_err(|e| AnalysisError::ParseError(e.to_string()))?;

        Ok(response.results)
    }
}
