//! Sandbox lifecycle: start, bounded wait, output capture and guaranteed teardown.

use crate::runtime::{
    CapturedOutput, ContainerRuntime, ResourceUsage, WaitOutcome, MAX_STDOUT_BYTES,
};
use fnrun_common::{FnrunError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Running,
    Completed,
    TimedOut,
    Crashed,
    Reaped,
}

/// Owns a created sandbox. Call `reap` on the normal path; if the guard is
/// dropped without it (early return, panic, cancelled task) removal is spawned
/// onto the current runtime instead.
pub struct SandboxGuard {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    state: SandboxState,
    grace: Duration,
}

impl std::fmt::Debug for SandboxGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxGuard")
            .field("container_id", &self.container_id)
            .field("state", &self.state)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl SandboxGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container_id: String, grace: Duration) -> Self {
        Self {
            runtime,
            container_id,
            state: SandboxState::Created,
            grace,
        }
    }

    pub fn id(&self) -> &str {
        &self.container_id
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    fn advance(&mut self, next: SandboxState) {
        debug!(container_id = %self.container_id, from = ?self.state, to = ?next, "Sandbox state change");
        self.state = next;
    }

    /// Removes the sandbox, returning the state it was in beforehand.
    pub async fn reap(mut self) -> SandboxState {
        let terminal = self.state;
        match within(self.grace, self.runtime.remove(&self.container_id)).await {
            Ok(()) => self.advance(SandboxState::Reaped),
            // Left unreaped so Drop retries in the background
            Err(e) => warn!(container_id = %self.container_id, error = %e, "Sandbox removal failed"),
        }
        terminal
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.state == SandboxState::Reaped {
            return;
        }
        let container_id = std::mem::take(&mut self.container_id);
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match runtime.remove(&container_id).await {
                        Ok(()) => debug!(%container_id, "Sandbox reaped after drop"),
                        Err(e) => {
                            error!(%container_id, error = %e, "Failed to reap dropped sandbox")
                        }
                    }
                });
            }
            Err(_) => {
                error!(%container_id, "No async runtime to reap sandbox; left for the startup sweep")
            }
        }
    }
}

/// What happened inside one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub container_id: String,
    /// `Completed`, `TimedOut` or `Crashed`.
    pub state: SandboxState,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
    pub timeout: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set when the runtime itself failed while supervising.
    pub failure: Option<String>,
    /// Sampled while the sandbox ran; `None` when no sample was taken.
    pub usage: Option<ResourceUsage>,
}

pub struct ExecutionSupervisor {
    grace: Duration,
}

impl ExecutionSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Starts the sandbox and drives it to a terminal state. The sandbox is
    /// reaped before this returns. A start failure is returned as `Err` with
    /// its provisioning classification; everything after start is a report.
    #[instrument(skip(self, sandbox), fields(container_id = %sandbox.id()))]
    pub async fn run(&self, mut sandbox: SandboxGuard, timeout: Duration) -> Result<RunReport> {
        let runtime = sandbox.runtime.clone();
        let id = sandbox.id().to_string();

        if let Err(e) = runtime.start(&id).await {
            let err = FnrunError::from(e);
            warn!(error = %err, "Sandbox failed to start");
            sandbox.reap().await;
            return Err(err);
        }
        sandbox.advance(SandboxState::Running);

        let mut exit_code = None;
        let mut oom_killed = false;
        let mut failure = None;
        let (waited, usage) = tokio::join!(
            runtime.wait_with_timeout(&id, timeout),
            self.sample_usage(&*runtime, &id),
        );
        match waited {
            Ok(WaitOutcome::Exited(status)) => {
                exit_code = Some(status.code);
                oom_killed = status.oom_killed;
                if status.success() {
                    sandbox.advance(SandboxState::Completed);
                } else {
                    sandbox.advance(SandboxState::Crashed);
                }
            }
            Ok(WaitOutcome::TimedOut) => {
                info!(?timeout, "Sandbox exceeded its timeout, killing");
                if let Err(e) = within(self.grace, runtime.kill(&id)).await {
                    warn!(error = %e, "Kill after timeout failed; removal will force it");
                }
                sandbox.advance(SandboxState::TimedOut);
            }
            Err(e) => {
                warn!(error = %e, "Lost track of sandbox while waiting");
                if let Err(kill_err) = within(self.grace, runtime.kill(&id)).await {
                    warn!(error = %kill_err, "Kill after lost wait failed; removal will force it");
                }
                failure = Some(format!("wait failed: {e}"));
                sandbox.advance(SandboxState::Crashed);
            }
        }

        let output = match within(self.grace, runtime.logs(&id)).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Output capture failed");
                if sandbox.state() == SandboxState::Completed {
                    failure = Some(format!("output capture failed: {e}"));
                    sandbox.advance(SandboxState::Crashed);
                }
                CapturedOutput::default()
            }
        };
        if output.stdout_truncated && sandbox.state() == SandboxState::Completed {
            warn!(limit = MAX_STDOUT_BYTES, "Sandbox stdout over the capture limit");
            failure = Some(format!("output exceeded {MAX_STDOUT_BYTES} bytes"));
            sandbox.advance(SandboxState::Crashed);
        }

        let state = sandbox.reap().await;
        Ok(RunReport {
            container_id: id,
            state,
            exit_code,
            oom_killed,
            timeout,
            stdout: output.stdout,
            stderr: output.stderr,
            failure,
            usage,
        })
    }

    /// One best-effort resource sample, taken while the sandbox runs.
    async fn sample_usage(&self, runtime: &dyn ContainerRuntime, id: &str) -> Option<ResourceUsage> {
        match within(self.grace, runtime.stats(id)).await {
            Ok(usage) => usage,
            Err(e) => {
                debug!(error = %e, "Resource sample unavailable");
                None
            }
        }
    }
}

/// Runs a runtime call bounded by `grace`, flattening both failure modes into text.
async fn within<T, F>(grace: Duration, call: F) -> std::result::Result<T, String>
where
    F: Future<Output = crate::Result<T>>,
{
    match tokio::time::timeout(grace, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("exceeded {grace:?}")),
    }
}
