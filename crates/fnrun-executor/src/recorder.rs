use crate::parser::ExecutionOutcome;
use crate::runtime::ResourceUsage;
use chrono::{DateTime, Utc};
use fnrun_common::{FunctionId, Metric, Result};
use fnrun_store::MetricStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub fn millis(elapsed: Duration) -> f64 {
    elapsed.as_nanos() as f64 / 1_000_000.0
}

/// Facts about one invocation attempt, gathered by the engine.
pub struct Attempt<'a> {
    pub request_id: &'a str,
    pub function_id: FunctionId,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub payload_size: u64,
    pub outcome: &'a ExecutionOutcome,
    pub exit_code: Option<i64>,
    pub container_id: Option<&'a str>,
    pub usage: Option<ResourceUsage>,
}

/// Writes exactly one metric row per attempt.
pub struct MetricsRecorder {
    store: Arc<dyn MetricStore>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self { store }
    }

    pub fn to_metric(attempt: &Attempt<'_>) -> Metric {
        let outcome = attempt.outcome;
        Metric {
            request_id: attempt.request_id.to_string(),
            function_id: attempt.function_id,
            started_at: attempt.started_at,
            duration_ms: millis(attempt.elapsed),
            success: outcome.success,
            error_kind: outcome.error.as_ref().map(|e| e.kind),
            error_message: outcome.error.as_ref().map(|e| e.message.clone()),
            exit_code: attempt.exit_code,
            payload_size: attempt.payload_size,
            response_size: outcome.response_size(),
            container_id: attempt.container_id.map(str::to_string),
            memory_usage_mb: attempt.usage.and_then(|u| u.memory_mb),
            cpu_usage_percent: attempt.usage.and_then(|u| u.cpu_percent),
        }
    }

    pub async fn record(&self, attempt: &Attempt<'_>) -> Result<Metric> {
        let metric = Self::to_metric(attempt);
        self.store.insert_metric(&metric).await?;
        debug!(%metric, "Metric recorded");
        Ok(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnrun_common::{ErrorKind, ExecutionError};
    use fnrun_store::{InMemoryStore, MetricFilter};
    use serde_json::json;

    #[tokio::test]
    async fn test_record_success_and_failure() {
        let store = InMemoryStore::new();
        let recorder = MetricsRecorder::new(Arc::new(store.clone()));
        let ok = ExecutionOutcome {
            success: true,
            result: json!({"a": 1}),
            error: None,
            logs: None,
        };
        let metric = recorder
            .record(&Attempt {
                request_id: "r1",
                function_id: 3,
                started_at: Utc::now(),
                elapsed: Duration::from_micros(2500),
                payload_size: 9,
                outcome: &ok,
                exit_code: Some(0),
                container_id: Some("c1"),
                usage: Some(ResourceUsage {
                    memory_mb: Some(20.5),
                    cpu_percent: None,
                }),
            })
            .await
            .unwrap();
        assert_eq!(metric.duration_ms, 2.5);
        assert_eq!(metric.response_size, 7);
        assert_eq!(metric.payload_size, 9);
        assert_eq!(metric.memory_usage_mb, Some(20.5));
        assert_eq!(metric.cpu_usage_percent, None);

        let failed = ExecutionOutcome::failed(ExecutionError::new(ErrorKind::Busy, "full"));
        recorder
            .record(&Attempt {
                request_id: "r2",
                function_id: 3,
                started_at: Utc::now(),
                elapsed: Duration::from_micros(10),
                payload_size: 9,
                outcome: &failed,
                exit_code: None,
                container_id: None,
                usage: None,
            })
            .await
            .unwrap();

        let rows = store.query_metrics(3, &MetricFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        let busy = rows.iter().find(|m| m.request_id == "r2").unwrap();
        assert!(!busy.success);
        assert_eq!(busy.error_kind, Some(ErrorKind::Busy));
        assert!(busy.container_id.is_none());
        assert!(busy.memory_usage_mb.is_none());
    }
}
