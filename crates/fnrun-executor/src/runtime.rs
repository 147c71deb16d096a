//! Container runtime seam. `DockerRuntime` talks to a real daemon; tests script
//! behaviour through `test_utils::MockRuntime`.

use crate::parser::MAX_STDERR_BYTES;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    /// Docker `binds` syntax: `host:container[:ro]`.
    pub fn to_bind_string(&self) -> String {
        let mut bind = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids: i64,
    pub network_disabled: bool,
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub mounts: Vec<BindMount>,
    pub limits: SandboxLimits,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
    pub oom_killed: bool,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0 && !self.oom_killed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// stdout kept from one sandbox. Anything past it fails the invocation.
pub const MAX_STDOUT_BYTES: usize = 1024 * 1024;

/// Output of one sandbox, bounded while it is collected: stdout keeps its
/// head, stderr keeps its tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set once stdout went past `MAX_STDOUT_BYTES`.
    pub stdout_truncated: bool,
}

impl CapturedOutput {
    pub fn push_stdout(&mut self, chunk: &[u8]) {
        let room = MAX_STDOUT_BYTES.saturating_sub(self.stdout.len());
        if chunk.len() > room {
            self.stdout_truncated = true;
        }
        self.stdout.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn push_stderr(&mut self, chunk: &[u8]) {
        self.stderr.extend_from_slice(chunk);
        let excess = self.stderr.len().saturating_sub(MAX_STDERR_BYTES);
        if excess > 0 {
            self.stderr.drain(..excess);
        }
    }
}

/// One resource sample of a running sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes `image` available locally, pulling it when `pull` is set.
    async fn ensure_image(&self, image: &str, pull: bool) -> Result<()>;

    /// Creates a stopped sandbox and returns its id.
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Blocks until the sandbox stops.
    async fn wait(&self, id: &str) -> Result<ExitStatus>;

    async fn logs(&self, id: &str) -> Result<CapturedOutput>;

    async fn kill(&self, id: &str) -> Result<()>;

    /// Samples resource usage once. `None` when the runtime cannot tell.
    async fn stats(&self, _id: &str) -> Result<Option<ResourceUsage>> {
        Ok(None)
    }

    /// Force-removes the sandbox. Removing an unknown id succeeds.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Removes every sandbox carrying `label`, returning how many were removed.
    async fn sweep(&self, _label: &str) -> Result<usize> {
        Ok(0)
    }

    /// `wait` bounded by `timeout`. The sandbox keeps running on `TimedOut`.
    async fn wait_with_timeout(&self, id: &str, timeout: Duration) -> Result<WaitOutcome> {
        match tokio::time::timeout(timeout, self.wait(id)).await {
            Ok(status) => status.map(WaitOutcome::Exited),
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }
}
