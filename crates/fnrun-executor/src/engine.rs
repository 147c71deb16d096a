//! The engine: registry, admission, provisioning, supervision and metrics
//! wired into the `execute` entry point.

use crate::admission::AdmissionGate;
use crate::code_store::{CodeStore, FsCodeStore};
use crate::config::EngineConfig;
use crate::parser::{self, ExecutionOutcome};
use crate::provisioner::SandboxProvisioner;
use crate::recorder::{millis, Attempt, MetricsRecorder};
use crate::registry::{Deployment, FunctionRegistry, FunctionUpdate, NewFunction};
use crate::runtime::{ContainerRuntime, ResourceUsage};
use crate::supervisor::ExecutionSupervisor;
use crate::MANAGED_LABEL;
use chrono::{DateTime, Utc};
use fnrun_common::{
    FnrunError, Function, FunctionId, InvocationResponse, Language, Metric, Result, Value,
};
use fnrun_store::{
    timeseries, FunctionStore, InMemoryStore, MetricFilter, MetricStore, MetricSummary, Period,
    TimeBucket,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of the sandboxed part of an invocation.
struct SandboxRun {
    outcome: ExecutionOutcome,
    exit_code: Option<i64>,
    container_id: Option<String>,
    usage: Option<ResourceUsage>,
}

impl SandboxRun {
    fn failed(err: &FnrunError, container_id: Option<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::from(err),
            exit_code: None,
            container_id,
            usage: None,
        }
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    registry: FunctionRegistry,
    provisioner: SandboxProvisioner,
    supervisor: ExecutionSupervisor,
    recorder: MetricsRecorder,
    metrics: Arc<dyn MetricStore>,
    runtime: Arc<dyn ContainerRuntime>,
    gate: AdmissionGate,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        code: Arc<dyn CodeStore>,
        functions: Arc<dyn FunctionStore>,
        metrics: Arc<dyn MetricStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        info!(
            max_concurrent = config.max_concurrent_sandboxes,
            max_queue = config.max_queue_depth,
            "Initializing execution engine"
        );
        Ok(Self {
            registry: FunctionRegistry::new(functions, code.clone()),
            provisioner: SandboxProvisioner::new(runtime.clone(), code, config.clone()),
            supervisor: ExecutionSupervisor::new(config.teardown_grace()),
            recorder: MetricsRecorder::new(metrics.clone()),
            gate: AdmissionGate::new(config.max_concurrent_sandboxes, config.max_queue_depth),
            metrics,
            runtime,
            config,
        })
    }

    /// Engine with a filesystem code store at `functions_dir` and in-memory
    /// function and metric stores.
    pub async fn in_memory(config: EngineConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let code = FsCodeStore::open(&config.functions_dir).await?;
        let store = InMemoryStore::new();
        Self::new(
            config,
            runtime,
            Arc::new(code),
            Arc::new(store.clone()),
            Arc::new(store),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Reloads persisted functions; call once at startup.
    pub async fn restore(&self) -> Result<usize> {
        self.registry.restore().await
    }

    /// Removes sandboxes left behind by a previous process.
    pub async fn sweep_stranded(&self) -> Result<usize> {
        self.runtime
            .sweep(MANAGED_LABEL)
            .await
            .map_err(|e| FnrunError::Internal(format!("sweep failed: {e}")))
    }

    // --- Invocation ---

    /// Runs `function_id` once with `payload`. Sandbox failures come back as a
    /// failed response; only an unknown function is an `Err`.
    #[instrument(skip(self, payload))]
    pub async fn execute(
        self: &Arc<Self>,
        function_id: FunctionId,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<InvocationResponse> {
        let function = self.registry.lookup(function_id).await?;
        Ok(self.dispatch(function, payload, timeout).await)
    }

    #[instrument(skip(self, payload))]
    pub async fn execute_route(
        self: &Arc<Self>,
        route: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<InvocationResponse> {
        let function = self.registry.lookup_route(route).await?;
        Ok(self.dispatch(function, payload, timeout).await)
    }

    /// Runs the invocation on its own task so the sandbox is driven to the end
    /// and metered even if the caller goes away.
    async fn dispatch(
        self: &Arc<Self>,
        function: Function,
        payload: Value,
        timeout: Option<Duration>,
    ) -> InvocationResponse {
        let request_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let payload_json = payload.to_string();
        let payload_size = payload_json.len() as u64;
        let function_id = function.id;

        let engine = self.clone();
        let task_request_id = request_id.clone();
        let task = tokio::spawn(async move {
            engine
                .invoke(function, payload_json, task_request_id, started_at, clock, timeout)
                .await
        });

        match task.await {
            Ok(response) => response,
            Err(e) => {
                error!(%request_id, function_id, error = %e, "Invocation task failed");
                let outcome =
                    ExecutionOutcome::from(&FnrunError::Crashed(format!("invocation aborted: {e}")));
                self.conclude(Attempt {
                    request_id: &request_id,
                    function_id,
                    started_at,
                    elapsed: clock.elapsed(),
                    payload_size,
                    outcome: &outcome,
                    exit_code: None,
                    container_id: None,
                    usage: None,
                })
                .await
            }
        }
    }

    async fn invoke(
        self: Arc<Self>,
        function: Function,
        payload_json: String,
        request_id: String,
        started_at: DateTime<Utc>,
        clock: Instant,
        timeout: Option<Duration>,
    ) -> InvocationResponse {
        // Queueing for a slot spends the same budget as running
        let timeout = self.config.effective_timeout(timeout, function.timeout());
        let deadline = tokio::time::Instant::now() + timeout;
        let run = match self.gate.admit_within(timeout).await {
            Ok(permit) => {
                let remaining = deadline
                    .saturating_duration_since(tokio::time::Instant::now())
                    .max(Duration::from_millis(1));
                let run = self
                    .run_sandboxed(&function, &payload_json, &request_id, remaining)
                    .await;
                drop(permit);
                run
            }
            Err(e) => {
                warn!(%request_id, function_id = function.id, error = %e, "Invocation rejected");
                SandboxRun::failed(&e, None)
            }
        };

        self.conclude(Attempt {
            request_id: &request_id,
            function_id: function.id,
            started_at,
            elapsed: clock.elapsed(),
            payload_size: payload_json.len() as u64,
            outcome: &run.outcome,
            exit_code: run.exit_code,
            container_id: run.container_id.as_deref(),
            usage: run.usage,
        })
        .await
    }

    async fn run_sandboxed(
        &self,
        function: &Function,
        payload_json: &str,
        request_id: &str,
        timeout: Duration,
    ) -> SandboxRun {
        let sandbox = match self
            .provisioner
            .prepare(function, payload_json, request_id)
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(%request_id, error = %e, "Sandbox provisioning failed");
                return SandboxRun::failed(&e, None);
            }
        };

        let container_id = sandbox.id().to_string();
        match self.supervisor.run(sandbox, timeout).await {
            Ok(report) => SandboxRun {
                outcome: parser::interpret(&report),
                exit_code: report.exit_code,
                container_id: Some(container_id),
                usage: report.usage,
            },
            Err(e) => SandboxRun::failed(&e, Some(container_id)),
        }
    }

    /// Records the metric and builds the response from the same numbers.
    async fn conclude(&self, attempt: Attempt<'_>) -> InvocationResponse {
        let degraded = match self.recorder.record(&attempt).await {
            Ok(_) => false,
            Err(e) => {
                error!(request_id = %attempt.request_id, error = %e, "Failed to persist invocation metric");
                true
            }
        };

        let outcome = attempt.outcome;
        info!(
            request_id = %attempt.request_id,
            function_id = attempt.function_id,
            success = outcome.success,
            duration_ms = millis(attempt.elapsed),
            "Invocation finished"
        );
        InvocationResponse {
            request_id: attempt.request_id.to_string(),
            function_id: attempt.function_id,
            success: outcome.success,
            result: outcome.result.clone(),
            error: outcome.error.clone(),
            logs: outcome.logs.clone(),
            duration_ms: millis(attempt.elapsed),
            started_at: attempt.started_at,
            degraded,
        }
    }

    // --- Function management ---

    pub async fn register(&self, new: NewFunction) -> Result<Function> {
        self.registry.register(new).await
    }

    pub async fn deploy(&self, deployment: Deployment) -> Result<Function> {
        self.registry.deploy(deployment).await
    }

    pub async fn update(&self, id: FunctionId, update: FunctionUpdate) -> Result<Function> {
        self.registry.update(id, update).await
    }

    pub async fn delete(&self, id: FunctionId) -> Result<Function> {
        self.registry.delete(id).await
    }

    pub async fn adopt_existing(
        &self,
        id: FunctionId,
        name: &str,
        route: &str,
        language: Language,
    ) -> Result<Function> {
        self.registry.adopt_existing(id, name, route, language).await
    }

    pub async fn get_function(&self, id: FunctionId) -> Result<Function> {
        self.registry.lookup(id).await
    }

    pub async fn list_functions(&self) -> Vec<Function> {
        self.registry.list().await
    }

    // --- Metrics ---

    /// Metric rows, newest first. History outlives deletion, so rows of a
    /// deleted function are still returned.
    pub async fn get_metrics(&self, function_id: FunctionId, filter: &MetricFilter) -> Result<Vec<Metric>> {
        let rows = self.metrics.query_metrics(function_id, filter).await?;
        if rows.is_empty() && !self.registry.contains(function_id).await {
            return Err(FnrunError::NotFound(format!("function {function_id}")));
        }
        Ok(rows)
    }

    pub async fn summary(&self, function_id: FunctionId, days: Option<u32>) -> Result<MetricSummary> {
        let function = self.registry.lookup(function_id).await?;
        self.summarize(&function, days).await
    }

    pub async fn summaries(&self, days: Option<u32>) -> Result<Vec<MetricSummary>> {
        let mut summaries = Vec::new();
        for function in self.registry.list().await {
            summaries.push(self.summarize(&function, days).await?);
        }
        Ok(summaries)
    }

    async fn summarize(&self, function: &Function, days: Option<u32>) -> Result<MetricSummary> {
        let filter = days.map(MetricFilter::last_days).unwrap_or_else(MetricFilter::unbounded);
        let rows = self.metrics.query_metrics(function.id, &filter).await?;
        Ok(MetricSummary::from_metrics(function.id, &function.name, &rows))
    }

    /// Buckets a function's whole history. Unknown functions yield no buckets.
    pub async fn timeseries(&self, function_id: FunctionId, period: Period) -> Result<Vec<TimeBucket>> {
        if !self.registry.contains(function_id).await {
            return Ok(Vec::new());
        }
        let rows = self
            .metrics
            .query_metrics(function_id, &MetricFilter::unbounded())
            .await?;
        Ok(timeseries(&rows, period))
    }
}
