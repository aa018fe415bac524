//! Error types shared outside the scheduler.
//!
//! Queue, scheduler and service errors live next to the code that raises
//! them; this module holds the errors of the analysis backend.

use thiserror::Error;

/// Errors that can occur when calling the analysis backend.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse analysis response: {0}")]
    ParseError(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),
}
