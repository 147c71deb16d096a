// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use chrono;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use serde_json::Value;
use thiserror::Error;
pub use uuid;

pub type FunctionId = u64;

#[derive(Error, Debug)]
pub enum FnrunError {
    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Route already registered: {0}")]
    RouteConflict(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Handler code not found: {0}")]
    CodeNotFound(String),

    #[error("Base image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("Sandbox provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("Execution timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Execution crashed: {0}")]
    Crashed(String),

    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("Store Error: {0}")]
    Store(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl FnrunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FnrunError::NotFound(_) => ErrorKind::NotFound,
            FnrunError::RouteConflict(_) => ErrorKind::RouteConflict,
            FnrunError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FnrunError::InvalidRoute(_)
            | FnrunError::InvalidRequest(_)
            | FnrunError::UnsupportedLanguage(_) => ErrorKind::InvalidRequest,
            FnrunError::CodeNotFound(_) => ErrorKind::CodeNotFound,
            FnrunError::ImageUnavailable(_) => ErrorKind::ImageUnavailable,
            FnrunError::ProvisionFailed(_) => ErrorKind::ProvisionFailed,
            FnrunError::TimedOut(_) => ErrorKind::TimedOut,
            FnrunError::Crashed(_) => ErrorKind::Crashed,
            FnrunError::Busy(_) => ErrorKind::Busy,
            FnrunError::Store(_) => ErrorKind::StoreError,
            FnrunError::Config(_) => ErrorKind::Config,
            FnrunError::Io(_) | FnrunError::Internal(_) => ErrorKind::Internal,
        }
    }
}

// Define the primary Result type for fnrun operations
pub type Result<T> = std::result::Result<T, FnrunError>;

/// Machine-readable failure category carried on responses and metric rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    RouteConflict,
    AlreadyExists,
    InvalidRequest,
    CodeNotFound,
    ImageUnavailable,
    ProvisionFailed,
    TimedOut,
    Crashed,
    Busy,
    StoreError,
    Config,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Runtimes a function can be written for. Each one maps to exactly one base
/// image and one invocation convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
        }
    }

    /// File name of the entry point inside a function's code directory.
    pub fn handler_file(&self) -> &'static str {
        match self {
            Language::Python => "handler.py",
            Language::Javascript => "handler.js",
        }
    }

    pub fn interpreter(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "node",
        }
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = FnrunError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::Javascript),
            other => Err(FnrunError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// A registered unit of user code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub route: String,
    pub language: Language,
    /// Directory holding the handler entry point.
    pub code_location: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Function {
    pub fn handler_path(&self) -> PathBuf {
        self.code_location.join(self.language.handler_file())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }
}

impl From<&FnrunError> for ExecutionError {
    fn from(err: &FnrunError) -> Self {
        ExecutionError::new(err.kind(), err.to_string())
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What `execute` hands back to the caller. Failures inside the sandbox are
/// reported here, never as an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub request_id: String,
    pub function_id: FunctionId,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    pub duration_ms: f64,
    pub started_at: DateTime<Utc>,
    /// Set when the metric row for this invocation could not be persisted.
    #[serde(default)]
    pub degraded: bool,
}

impl InvocationResponse {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// One persisted row per invocation attempt. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub request_id: String,
    pub function_id: FunctionId,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub payload_size: u64,
    pub response_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Sandbox memory in MiB, sampled once while it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Metric(request_id: {}, function_id: {}, success: {}, duration_ms: {:.3}, error_kind: {:?})",
            self.request_id, self.function_id, self.success, self.duration_ms, self.error_kind
        )
    }
}
