use crate::runtime::{CapturedOutput, ContainerRuntime, ExitStatus, ResourceUsage, SandboxSpec};
use crate::{ExecutorError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    Stats, StatsOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// `ContainerRuntime` backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker_client: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker_client: Arc<Docker>) -> Self {
        Self { docker_client }
    }

    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub fn client(&self) -> &Docker {
        &self.docker_client
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

// Docker reports an absent bind source as a plain 400/500 with this text
fn is_missing_mount(err: &BollardError) -> bool {
    match err {
        BollardError::DockerResponseServerError { message, .. } => {
            message.contains("bind source path does not exist")
                || message.contains("invalid mount config")
                || (message.contains("mount") && message.contains("no such file or directory"))
        }
        _ => false,
    }
}

/// CPU share over the sampling window, as `docker stats` computes it.
fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> Option<f64> {
    if system_delta == 0 || online_cpus == 0 {
        return None;
    }
    Some(cpu_delta as f64 / system_delta as f64 * online_cpus as f64 * 100.0)
}

fn usage_from_stats(stats: &Stats) -> ResourceUsage {
    let memory_mb = stats
        .memory_stats
        .usage
        .map(|bytes| bytes as f64 / (1024.0 * 1024.0));

    let cpu = &stats.cpu_stats;
    let previous = &stats.precpu_stats;
    let cpu_delta = cpu
        .cpu_usage
        .total_usage
        .saturating_sub(previous.cpu_usage.total_usage);
    // A one-shot sample has no previous system reading to diff against
    let cpu_percent = match (cpu.system_cpu_usage, previous.system_cpu_usage) {
        (Some(now), Some(before)) if before > 0 => cpu_percent(
            cpu_delta,
            now.saturating_sub(before),
            cpu.online_cpus.unwrap_or(1),
        ),
        _ => None,
    };

    ResourceUsage {
        memory_mb,
        cpu_percent,
    }
}

fn host_config(spec: &SandboxSpec) -> HostConfig {
    let limits = &spec.limits;
    HostConfig {
        binds: Some(spec.mounts.iter().map(|m| m.to_bind_string()).collect()),
        memory: Some(limits.memory_bytes),
        // Equal to memory: no swap headroom
        memory_swap: Some(limits.memory_bytes),
        nano_cpus: Some(limits.nano_cpus),
        pids_limit: Some(limits.pids),
        network_mode: limits.network_disabled.then(|| "none".to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self))]
    async fn ensure_image(&self, image: &str, pull: bool) -> Result<()> {
        match self.docker_client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => {
                return Err(ExecutorError::ImageUnavailable {
                    image: image.to_string(),
                    reason: e.to_string(),
                })
            }
        }
        if !pull {
            return Err(ExecutorError::ImageUnavailable {
                image: image.to_string(),
                reason: "not present locally and pulling is disabled".to_string(),
            });
        }

        info!(%image, "Pulling base image...");
        let options = Some(CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut progress = self.docker_client.create_image(options, None, None);
        while let Some(step) = progress.next().await {
            if let Err(e) = step {
                return Err(ExecutorError::ImageUnavailable {
                    image: image.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        info!(%image, "Base image pulled");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false), // Keep stdout and stderr as separate streams
            network_disabled: Some(spec.limits.network_disabled),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        match self.docker_client.create_container(options, config).await {
            Ok(body) => {
                debug!(container_id = %body.id, "Container created");
                Ok(body.id)
            }
            Err(e) if status_code(&e) == Some(404) => Err(ExecutorError::ImageUnavailable {
                image: spec.image.clone(),
                reason: e.to_string(),
            }),
            Err(e) if is_missing_mount(&e) => Err(ExecutorError::MountSourceMissing(e.to_string())),
            Err(e) => Err(ExecutorError::CreationFailed(e)),
        }
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .docker_client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_missing_mount(&e) => Err(ExecutorError::MountSourceMissing(e.to_string())),
            Err(e) => Err(ExecutorError::StartFailed(e)),
        }
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker_client.wait_container(id, Some(wait_options));
        let code = match wait_stream.next().await {
            Some(Ok(body)) => body.status_code,
            // bollard surfaces a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(ExecutorError::WaitFailed(e)),
            None => {
                return Err(ExecutorError::Internal(
                    "container wait stream ended unexpectedly".to_string(),
                ))
            }
        };

        let oom_killed = match self
            .docker_client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(e) => {
                warn!(container_id = %id, error = %e, "Inspect after exit failed");
                false
            }
        };
        Ok(ExitStatus { code, oom_killed })
    }

    async fn logs(&self, id: &str) -> Result<CapturedOutput> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });
        let mut stream = self.docker_client.logs(id, options);
        let mut output = CapturedOutput::default();
        while let Some(entry) = stream.next().await {
            match entry.map_err(ExecutorError::LogRetrievalFailed)? {
                LogOutput::StdOut { message } => output.push_stdout(&message),
                LogOutput::StdErr { message } => output.push_stderr(&message),
                _ => {}
            }
        }
        Ok(output)
    }

    async fn stats(&self, id: &str) -> Result<Option<ResourceUsage>> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });
        let mut stream = self.docker_client.stats(id, options);
        match stream.next().await {
            Some(Ok(stats)) => Ok(Some(usage_from_stats(&stats))),
            // Already gone: a sandbox that finished before it could be sampled
            Some(Err(e)) if status_code(&e) == Some(404) => Ok(None),
            Some(Err(e)) => Err(ExecutorError::DockerApi(e)),
            None => Ok(None),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        match self
            .docker_client
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            // 409: already stopped, 404: already gone
            Err(e) if matches!(status_code(&e), Some(404) | Some(409)) => Ok(()),
            Err(e) => Err(ExecutorError::KillFailed(e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let remove_opts = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker_client.remove_container(id, remove_opts).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(ExecutorError::RemovalFailed(e)),
        }
    }

    #[instrument(skip(self))]
    async fn sweep(&self, label: &str) -> Result<usize> {
        let options = Some(ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        });
        let stranded = self.docker_client.list_containers(options).await?;

        let mut removed = 0;
        for container in stranded {
            let Some(id) = container.id else { continue };
            match self.remove(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container_id = %id, error = %e, "Failed to remove stranded container"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed stranded sandboxes");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BindMount, SandboxLimits};
    use std::path::PathBuf;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            name: "fnrun-1-req".into(),
            image: "python:3.11-alpine".into(),
            command: vec!["python".into(), "/function/handler.py".into()],
            env: vec!["PAYLOAD={}".into()],
            working_dir: "/function".into(),
            mounts: vec![BindMount {
                source: PathBuf::from("/srv/functions/1"),
                target: "/function".into(),
                read_only: true,
            }],
            limits: SandboxLimits {
                memory_bytes: 128 * 1024 * 1024,
                nano_cpus: 500_000_000,
                pids: 64,
                network_disabled: true,
            },
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_host_config_limits() {
        let host = host_config(&spec());
        assert_eq!(
            host.binds,
            Some(vec!["/srv/functions/1:/function:ro".to_string()])
        );
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
    }

    #[test]
    fn test_cpu_percent() {
        assert_eq!(cpu_percent(50, 1_000, 2), Some(10.0));
        assert_eq!(cpu_percent(0, 1_000, 4), Some(0.0));
        assert_eq!(cpu_percent(50, 0, 2), None);
        assert_eq!(cpu_percent(50, 1_000, 0), None);
    }

    #[test]
    fn test_missing_mount_detection() {
        let err = BollardError::DockerResponseServerError {
            status_code: 400,
            message: "invalid mount config for type \"bind\": bind source path does not exist: /srv/functions/9".into(),
        };
        assert!(is_missing_mount(&err));

        let other = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "something else".into(),
        };
        assert!(!is_missing_mount(&other));
        assert_eq!(status_code(&other), Some(500));
    }
}
