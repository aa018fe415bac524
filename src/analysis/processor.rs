//! Task processor for log analysis tasks.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::scheduler::{ResultMap, Task, TaskPayload, TaskProcessor, TaskType};

use super::backend::{AnalysisBackend, AnalysisResult};

/// Hook run on every analysis result, e.g. to raise alerts.
#[async_trait]
pub trait AlertEvaluator: Send + Sync {
    async fn evaluate_result(&self, result: &AnalysisResult) -> anyhow::Result<()>;
}

/// Processes `log_analysis` tasks through an [`AnalysisBackend`].
///
/// The result map records how many logs were analyzed, how many results came
/// back and how many of them are anomalies.
pub struct LogAnalysisProcessor {
    backend: Arc<dyn AnalysisBackend>,
    alert_evaluator: Option<Arc<dyn AlertEvaluator>>,
}

impl LogAnalysisProcessor {
    pub const NAME: &'static str = "LogAnalysisProcessor";

    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            backend,
            alert_evaluator: None,
        }
    }

    /// Runs `evaluator` on every result of a successful analysis.
    pub fn with_alert_evaluator(mut self, evaluator: Arc<dyn AlertEvaluator>) -> Self {
        self.alert_evaluator = Some(evaluator);
        self
    }

    async fn evaluate_alerts(&self, task: &Task, results: &[AnalysisResult]) {
        let Some(evaluator) = &self.alert_evaluator else {
            return;
        };

        for result in results {
            // Alerting problems never fail an analysis that succeeded
            if let Err(e) = evaluator.evaluate_result(result).await {
                warn!(
                    task_id = %task.id,
                    result_id = %result.id,
                    error = %e,
                    "Failed to evaluate alert for analysis result"
                );
            }
        }
    }
}

#[async_trait]
impl TaskProcessor for LogAnalysisProcessor {
    async fn process_task(&self, task: &Task) -> anyhow::Result<ResultMap> {
        let TaskPayload::LogAnalysis { log_ids } = &task.payload;

        if log_ids.is_empty() {
            bail!("no log ids in task payload");
        }

        let results = self
            .backend
            .analyze(log_ids)
            .await
            .context("log analysis failed")?;

        if results.is_empty() {
            bail!("no logs found for the given ids");
        }

        self.evaluate_alerts(task, &results).await;

        let analyzed_logs = results
            .iter()
            .map(|result| result.log_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let anomalies_found = results.iter().filter(|result| result.is_anomaly).count();

        info!(
            task_id = %task.id,
            analyzed_logs = analyzed_logs,
            anomalies_found = anomalies_found,
            "Log analysis task processed"
        );

        let mut result = ResultMap::new();
        result.insert("analyzed_logs".to_string(), json!(analyzed_logs));
        result.insert("analysis_results".to_string(), json!(results.len()));
        result.insert("anomalies_found".to_string(), json!(anomalies_found));
        Ok(result)
    }

    fn can_process(&self, task_type: TaskType) -> bool {
        task_type == TaskType::LogAnalysis
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}
