/// Test utilities for conditional test execution and a scripted runtime
use crate::runtime::{
    BindMount, CapturedOutput, ContainerRuntime, ExitStatus, ResourceUsage, SandboxLimits,
    SandboxSpec,
};
use crate::{ExecutorError, Result, FUNCTION_LABEL, MANAGED_LABEL};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub fn has_docker() -> bool {
    // Check if docker command exists
    Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return;
        }
    };
}

/// Usage every live mock sandbox reports.
pub const MOCK_USAGE: ResourceUsage = ResourceUsage {
    memory_mb: Some(12.0),
    cpu_percent: Some(3.5),
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a `MockRuntime` sandbox behaves once started.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
        delay: Duration,
    },
    /// Never exits on its own.
    Hang,
    OutOfMemory,
    ImageMissing,
    CreateRejected(String),
    MountMissing,
    WaitFails,
    LogsFail,
}

impl MockBehavior {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        MockBehavior::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn json(value: Value) -> Self {
        Self::stdout(format!("{value}\n"))
    }

    pub fn exit(code: i64, stderr: impl Into<String>) -> Self {
        MockBehavior::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
            delay: Duration::ZERO,
        }
    }

    /// Delays the exit of an `Exit` behaviour; other behaviours are unchanged.
    pub fn after(self, wait: Duration) -> Self {
        match self {
            MockBehavior::Exit {
                code,
                stdout,
                stderr,
                ..
            } => MockBehavior::Exit {
                code,
                stdout,
                stderr,
                delay: wait,
            },
            other => other,
        }
    }
}

#[derive(Debug)]
struct MockContainer {
    spec: SandboxSpec,
    behavior: MockBehavior,
}

/// In-process `ContainerRuntime` that scripts sandbox outcomes and counts
/// lifecycle calls, so reaping and admission can be asserted without Docker.
pub struct MockRuntime {
    default: Mutex<MockBehavior>,
    per_function: Mutex<HashMap<String, MockBehavior>>,
    missing_images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    specs: Mutex<Vec<SandboxSpec>>,
    created: AtomicUsize,
    removed: AtomicUsize,
    killed: AtomicUsize,
    peak_live: AtomicUsize,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::with_default(MockBehavior::json(Value::Null))
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(behavior: MockBehavior) -> Self {
        Self {
            default: Mutex::new(behavior),
            per_function: Mutex::new(HashMap::new()),
            missing_images: Mutex::new(HashSet::new()),
            containers: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
        }
    }

    pub fn set_default(&self, behavior: MockBehavior) {
        *lock(&self.default) = behavior;
    }

    pub fn set_for_function(&self, function_id: u64, behavior: MockBehavior) {
        lock(&self.per_function)
            .insert(function_id.to_string(), behavior);
    }

    pub fn mark_image_missing(&self, image: &str) {
        lock(&self.missing_images).insert(image.to_string());
    }

    /// A minimal labelled spec, for driving the runtime directly.
    pub fn spec_for(function_id: u64) -> SandboxSpec {
        SandboxSpec {
            name: format!("fnrun-{function_id}-test"),
            image: "python:3.11-alpine".to_string(),
            command: vec!["python".to_string(), "/function/handler.py".to_string()],
            env: vec!["PAYLOAD=null".to_string()],
            working_dir: "/function".to_string(),
            mounts: vec![BindMount {
                source: PathBuf::from(format!("/tmp/functions/{function_id}")),
                target: "/function".to_string(),
                read_only: true,
            }],
            limits: SandboxLimits {
                memory_bytes: 128 * 1024 * 1024,
                nano_cpus: 500_000_000,
                pids: 64,
                network_disabled: true,
            },
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (FUNCTION_LABEL.to_string(), function_id.to_string()),
            ]),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn killed_count(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Sandboxes created and not yet removed.
    pub fn live_count(&self) -> usize {
        lock(&self.containers).len()
    }

    /// Highest number of simultaneously live sandboxes seen.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        lock(&self.specs).clone()
    }

    fn behavior_for(&self, spec: &SandboxSpec) -> MockBehavior {
        spec.labels
            .get(FUNCTION_LABEL)
            .and_then(|id| lock(&self.per_function).get(id).cloned())
            .unwrap_or_else(|| lock(&self.default).clone())
    }

    fn container_behavior(&self, id: &str) -> Result<MockBehavior> {
        lock(&self.containers)
            .get(id)
            .map(|c| c.behavior.clone())
            .ok_or_else(|| ExecutorError::Internal(format!("no such container: {id}")))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, image: &str, _pull: bool) -> Result<()> {
        let missing = lock(&self.missing_images).contains(image)
            || *lock(&self.default) == MockBehavior::ImageMissing;
        if missing {
            return Err(ExecutorError::ImageUnavailable {
                image: image.to_string(),
                reason: "pull access denied".to_string(),
            });
        }
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let behavior = self.behavior_for(spec);
        if let MockBehavior::CreateRejected(reason) = &behavior {
            return Err(ExecutorError::Rejected(reason.clone()));
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{n}");
        let live = {
            let mut containers = lock(&self.containers);
            containers.insert(
                id.clone(),
                MockContainer {
                    spec: spec.clone(),
                    behavior,
                },
            );
            containers.len()
        };
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        lock(&self.specs).push(spec.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        if self.container_behavior(id)? == MockBehavior::MountMissing {
            return Err(ExecutorError::MountSourceMissing(format!(
                "bind source path does not exist for {id}"
            )));
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus> {
        match self.container_behavior(id)? {
            MockBehavior::Exit { code, delay, .. } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ExitStatus {
                    code,
                    oom_killed: false,
                })
            }
            MockBehavior::Hang => std::future::pending().await,
            MockBehavior::OutOfMemory => Ok(ExitStatus {
                code: 137,
                oom_killed: true,
            }),
            MockBehavior::WaitFails => Err(ExecutorError::Internal(
                "daemon connection reset".to_string(),
            )),
            _ => Ok(ExitStatus {
                code: 0,
                oom_killed: false,
            }),
        }
    }

    async fn logs(&self, id: &str) -> Result<CapturedOutput> {
        match self.container_behavior(id)? {
            MockBehavior::Exit { stdout, stderr, .. } => {
                let mut output = CapturedOutput::default();
                output.push_stdout(stdout.as_bytes());
                output.push_stderr(stderr.as_bytes());
                Ok(output)
            }
            MockBehavior::OutOfMemory => {
                let mut output = CapturedOutput::default();
                output.push_stderr(b"Killed");
                Ok(output)
            }
            MockBehavior::LogsFail => Err(ExecutorError::Internal("log stream closed".to_string())),
            _ => Ok(CapturedOutput::default()),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        if lock(&self.containers).contains_key(id) {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<Option<ResourceUsage>> {
        Ok(lock(&self.containers)
            .contains_key(id)
            .then_some(MOCK_USAGE))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if lock(&self.containers).remove(id).is_some() {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn sweep(&self, label: &str) -> Result<usize> {
        let mut containers = lock(&self.containers);
        let before = containers.len();
        containers.retain(|_, c| !c.spec.labels.contains_key(label));
        let swept = before - containers.len();
        self.removed.fetch_add(swept, Ordering::SeqCst);
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle_counts() {
        let runtime = MockRuntime::with_default(MockBehavior::exit(2, "bad"));
        let id = runtime.create(&MockRuntime::spec_for(1)).await.unwrap();
        runtime.start(&id).await.unwrap();
        assert_eq!(runtime.wait(&id).await.unwrap().code, 2);
        assert_eq!(runtime.logs(&id).await.unwrap().stderr, b"bad");
        runtime.remove(&id).await.unwrap();
        runtime.remove(&id).await.unwrap();
        assert_eq!(runtime.created_count(), 1);
        assert_eq!(runtime.removed_count(), 1);
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn test_per_function_behavior_and_sweep() {
        let runtime = MockRuntime::new();
        runtime.set_for_function(2, MockBehavior::OutOfMemory);
        let a = runtime.create(&MockRuntime::spec_for(1)).await.unwrap();
        let b = runtime.create(&MockRuntime::spec_for(2)).await.unwrap();
        assert!(!runtime.wait(&a).await.unwrap().oom_killed);
        assert!(runtime.wait(&b).await.unwrap().oom_killed);

        assert_eq!(runtime.sweep(MANAGED_LABEL).await.unwrap(), 2);
        assert_eq!(runtime.live_count(), 0);
        assert_eq!(runtime.peak_live(), 2);
    }
}
