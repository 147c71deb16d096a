//! HTTP surface over the execution engine. Handlers only translate between
//! JSON and engine calls.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use fnrun_common::{Function, FunctionId, InvocationResponse, Language, Metric};
use fnrun_executor::{Engine, FunctionUpdate};
use fnrun_store::{MetricSummary, TimeBucket};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument};

pub mod error;
pub mod types;


pub use error::{status_for, AppError};
use types::{
    AdoptRequest, CreateFunctionRequest, Creation, HealthResponse, InvokeRequest, MetricsQuery,
    SummaryQuery, TimeseriesQuery, UpdateFunctionRequest,
};

type ApiResult<T> = Result<T, AppError>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Listener and persistence settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("FNRUN_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("FNRUN_PORT") {
            config.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("FNRUN_PORT must be a port number: {e}"))?;
        }
        if let Ok(dir) = std::env::var("FNRUN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}:{}: {e}", self.host, self.port))
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/functions", post(create_function).get(list_functions))
        .route(
            "/functions/:id",
            get(get_function).put(update_function).delete(delete_function),
        )
        .route("/functions/:id/execute", post(execute_function))
        .route("/invoke/*route", post(invoke_route))
        .route("/metrics/summary", get(all_summaries))
        .route("/metrics/function/:id", get(function_metrics))
        .route("/metrics/function/:id/summary", get(function_summary))
        .route("/metrics/function/:id/timeseries", get(function_timeseries))
        .route("/admin/functions/:id/adopt", post(adopt_function))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Failed invocations keep their structured body; only the status changes.
fn invocation_reply(response: InvocationResponse) -> Response {
    let status = response
        .error_kind()
        .map(status_for)
        .unwrap_or(StatusCode::OK);
    (status, Json(response)).into_response()
}

// --- Functions ---

#[instrument(skip(state, req), fields(name = %req.name))]
async fn create_function(
    State(state): State<AppState>,
    Json(req): Json<CreateFunctionRequest>,
) -> ApiResult<(StatusCode, Json<Function>)> {
    let function = match req.into_creation()? {
        Creation::Deploy(deployment) => state.engine.deploy(deployment).await?,
        Creation::Register(new) => state.engine.register(new).await?,
    };
    info!(function_id = function.id, route = %function.route, "Function created");
    Ok((StatusCode::CREATED, Json(function)))
}

async fn list_functions(State(state): State<AppState>) -> Json<Vec<Function>> {
    Json(state.engine.list_functions().await)
}

async fn get_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
) -> ApiResult<Json<Function>> {
    Ok(Json(state.engine.get_function(id).await?))
}

async fn update_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    Json(req): Json<UpdateFunctionRequest>,
) -> ApiResult<Json<Function>> {
    let update = FunctionUpdate::try_from(req)?;
    Ok(Json(state.engine.update(id, update).await?))
}

async fn delete_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
) -> ApiResult<Json<Function>> {
    Ok(Json(state.engine.delete(id).await?))
}

// --- Invocation ---

async fn execute_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    req: Option<Json<InvokeRequest>>,
) -> ApiResult<Response> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let response = state.engine.execute(id, req.payload(), req.timeout()).await?;
    Ok(invocation_reply(response))
}

async fn invoke_route(
    State(state): State<AppState>,
    Path(route): Path<String>,
    req: Option<Json<InvokeRequest>>,
) -> ApiResult<Response> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let response = state
        .engine
        .execute_route(&route, req.payload(), req.timeout())
        .await?;
    Ok(invocation_reply(response))
}

// --- Metrics ---

async fn function_metrics(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<Vec<Metric>>> {
    Ok(Json(state.engine.get_metrics(id, &query.into()).await?))
}

async fn function_summary(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<Json<MetricSummary>> {
    Ok(Json(state.engine.summary(id, query.days).await?))
}

async fn all_summaries(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<Json<Vec<MetricSummary>>> {
    Ok(Json(state.engine.summaries(query.days).await?))
}

async fn function_timeseries(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    Query(query): Query<TimeseriesQuery>,
) -> ApiResult<Json<Vec<TimeBucket>>> {
    let period = query.period()?;
    Ok(Json(state.engine.timeseries(id, period).await?))
}

// --- Admin ---

async fn adopt_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    Json(req): Json<AdoptRequest>,
) -> ApiResult<(StatusCode, Json<Function>)> {
    let language: Language = req.language.parse()?;
    let function = state
        .engine
        .adopt_existing(id, &req.name, &req.route, language)
        .await?;
    Ok((StatusCode::CREATED, Json(function)))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        functions: state.engine.list_functions().await.len(),
        in_flight: state.engine.in_flight(),
        timestamp: Utc::now(),
    })
}
