use bollard::errors::Error as BollardError;
use fnrun_common::FnrunError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the server)
pub use bollard;
pub use fnrun_common as common;
pub use fnrun_store as store;

pub mod admission;
pub mod code_store;
pub mod config;
pub mod docker;
pub mod engine;
pub mod parser;
pub mod provisioner;
pub mod recorder;
pub mod registry;
pub mod runtime;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use code_store::{CodeStore, FsCodeStore};
pub use config::{EngineConfig, ResourceLimits, RuntimeImages};
pub use docker::DockerRuntime;
pub use engine::Engine;
pub use registry::{Deployment, FunctionRegistry, FunctionUpdate, NewFunction};
pub use runtime::{
    CapturedOutput, ContainerRuntime, ExitStatus, ResourceUsage, SandboxSpec, WaitOutcome,
};
pub use supervisor::{ExecutionSupervisor, RunReport, SandboxGuard, SandboxState};

/// Label put on every container the engine creates.
pub const MANAGED_LABEL: &str = "fnrun.managed";
pub const FUNCTION_LABEL: &str = "fnrun.function_id";
pub const REQUEST_LABEL: &str = "fnrun.request_id";

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Image {image} unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },
    #[error("Mount source missing: {0}")]
    MountSourceMissing(String),
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container wait failed: {0}")]
    WaitFailed(#[source] BollardError),
    #[error("Container kill failed: {0}")]
    KillFailed(#[source] BollardError),
    #[error("Container log retrieval failed: {0}")]
    LogRetrievalFailed(#[source] BollardError),
    #[error("Container removal failed: {0}")]
    RemovalFailed(#[source] BollardError),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError), // Catch-all for other bollard errors
    #[error("Runtime rejected request: {0}")]
    Rejected(String),
    #[error("Internal executor error: {0}")]
    Internal(String),
}

// Runtime failures surfacing before the handler runs are provisioning failures
impl From<ExecutorError> for FnrunError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::ImageUnavailable { .. } => FnrunError::ImageUnavailable(err.to_string()),
            ExecutorError::MountSourceMissing(_) => FnrunError::CodeNotFound(err.to_string()),
            other => FnrunError::ProvisionFailed(other.to_string()),
        }
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, ExecutorError>;
