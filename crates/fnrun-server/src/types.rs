use chrono::{DateTime, Utc};
use fnrun_common::{FnrunError, Language, Result, Value};
use fnrun_executor::{Deployment, FunctionUpdate, NewFunction};
use fnrun_store::{MetricFilter, Period, DEFAULT_METRIC_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Body of `POST /functions`. Carrying `code` deploys new source; carrying
/// `code_location` registers a handler that is already on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFunctionRequest {
    pub name: String,
    pub route: String,
    pub language: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_location: Option<PathBuf>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub enum Creation {
    Deploy(Deployment),
    Register(NewFunction),
}

impl CreateFunctionRequest {
    pub fn into_creation(self) -> Result<Creation> {
        let language: Language = self.language.parse()?;
        match (self.code, self.code_location) {
            (Some(source), None) => Ok(Creation::Deploy(Deployment {
                name: self.name,
                route: self.route,
                language,
                source,
                timeout_ms: self.timeout_ms,
            })),
            (None, Some(code_location)) => Ok(Creation::Register(NewFunction {
                name: self.name,
                route: self.route,
                language,
                code_location,
                timeout_ms: self.timeout_ms,
            })),
            _ => Err(FnrunError::InvalidRequest(
                "exactly one of `code` or `code_location` is required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFunctionRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TryFrom<UpdateFunctionRequest> for FunctionUpdate {
    type Error = FnrunError;

    fn try_from(req: UpdateFunctionRequest) -> Result<Self> {
        Ok(FunctionUpdate {
            name: req.name,
            route: req.route,
            language: req.language.map(|l| l.parse()).transpose()?,
            timeout_ms: req.timeout_ms,
            source: req.code,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl InvokeRequest {
    /// A missing payload is sent to the handler as `{}`.
    pub fn payload(&self) -> Value {
        self.payload
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdoptRequest {
    pub name: String,
    pub route: String,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

fn default_limit() -> usize {
    DEFAULT_METRIC_LIMIT
}

impl From<MetricsQuery> for MetricFilter {
    fn from(q: MetricsQuery) -> Self {
        MetricFilter {
            since: q.since,
            until: q.until,
            success: q.success,
            skip: q.skip,
            limit: q.limit,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryQuery {
    #[serde(default)]
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeseriesQuery {
    #[serde(default)]
    pub period: Option<String>,
}

impl TimeseriesQuery {
    pub fn period(&self) -> Result<Period> {
        self.period
            .as_deref()
            .map(str::parse)
            .unwrap_or(Ok(Period::Hourly))
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub functions: usize,
    pub in_flight: usize,
    pub timestamp: DateTime<Utc>,
}
