//! Log analysis processing.
//!
//! - **AnalysisBackend**: service that scores log records for anomalies
//! - **HttpAnalysisBackend**: JSON-over-HTTP client for that service
//! - **LogAnalysisProcessor**: task processor for `log_analysis` tasks
//! - **AlertEvaluator**: optional hook run on every analysis result

pub mod backend;
pub mod processor;

pub use backend::{AnalysisBackend, AnalysisResult, HttpAnalysisBackend};
pub use processor::{AlertEvaluator, LogAnalysisProcessor};
