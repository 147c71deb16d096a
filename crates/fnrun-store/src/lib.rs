// fnrun store - persistence contract for functions and invocation metrics
use fnrun_common::FnrunError;
use thiserror::Error;

mod file;
mod storage;
mod types;

pub use file::JsonFileStore;
pub use storage::{FunctionStore, InMemoryStore, MetricStore};
pub use types::*;

// Error Types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for FnrunError {
    fn from(err: StoreError) -> Self {
        FnrunError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
