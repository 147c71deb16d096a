//! Turns captured sandbox output into a structured outcome.

use crate::supervisor::{RunReport, SandboxState};
use fnrun_common::{ErrorKind, ExecutionError, FnrunError};
use serde_json::{json, Value};

/// stderr kept in error details and success logs.
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Value,
    pub error: Option<ExecutionError>,
    pub logs: Option<String>,
}

impl ExecutionOutcome {
    pub fn failed(error: ExecutionError) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error),
            logs: None,
        }
    }

    /// Bytes of what the caller receives: the result on success, the error otherwise.
    pub fn response_size(&self) -> u64 {
        let bytes = match &self.error {
            None => serde_json::to_vec(&self.result),
            Some(error) => serde_json::to_vec(error),
        };
        bytes.map(|b| b.len() as u64).unwrap_or(0)
    }
}

impl From<&FnrunError> for ExecutionOutcome {
    fn from(err: &FnrunError) -> Self {
        Self::failed(ExecutionError::from(err))
    }
}

/// Whitespace-only output is `null`, valid JSON is used as-is, anything else
/// is wrapped as `{"raw_output": ...}`.
pub fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(_) => json!({ "raw_output": text.trim_end_matches(['\r', '\n']) }),
    }
}

/// Keeps the tail of `bytes`, where the interesting part of a traceback lives.
fn bounded_text(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let start = bytes.len().saturating_sub(MAX_STDERR_BYTES);
    let text = String::from_utf8_lossy(&bytes[start..]);
    let text = text.trim_end();
    (!text.is_empty()).then(|| text.to_string())
}

/// Classifies a finished run. Only a clean exit counts as success; stdout of
/// a crashed or timed-out sandbox is never reported as a result.
pub fn interpret(report: &RunReport) -> ExecutionOutcome {
    let stderr = bounded_text(&report.stderr);
    match report.state {
        SandboxState::Completed => ExecutionOutcome {
            success: true,
            result: parse_stdout(&report.stdout),
            error: None,
            logs: stderr,
        },
        SandboxState::TimedOut => ExecutionOutcome::failed(ExecutionError {
            stderr,
            ..ExecutionError::from(&FnrunError::TimedOut(report.timeout))
        }),
        _ => {
            let message = if let Some(failure) = &report.failure {
                failure.clone()
            } else if report.oom_killed {
                "killed: memory limit exceeded".to_string()
            } else {
                match report.exit_code {
                    Some(code) => format!("process exited with code {code}"),
                    None => "sandbox stopped unexpectedly".to_string(),
                }
            };
            ExecutionOutcome::failed(ExecutionError {
                kind: ErrorKind::Crashed,
                message,
                exit_code: report.exit_code,
                stderr,
            })
        }
    }
}
