use crate::code_store::CodeStore;
use crate::config::EngineConfig;
use crate::runtime::{BindMount, ContainerRuntime, SandboxLimits, SandboxSpec};
use crate::supervisor::SandboxGuard;
use crate::{FUNCTION_LABEL, MANAGED_LABEL, REQUEST_LABEL};
use fnrun_common::{FnrunError, Function, Language, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Turns a function plus payload into a created, not yet started, sandbox.
pub struct SandboxProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    code: Arc<dyn CodeStore>,
    config: Arc<EngineConfig>,
}

impl SandboxProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        code: Arc<dyn CodeStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            runtime,
            code,
            config,
        }
    }

    pub fn build_spec(&self, function: &Function, payload_json: &str, request_id: &str) -> SandboxSpec {
        let config = &self.config;
        let entry_point = format!(
            "{}/{}",
            config.sandbox_code_path.trim_end_matches('/'),
            function.language.handler_file()
        );

        let mut env = vec![format!("{}={}", config.payload_env_var, payload_json)];
        if function.language == Language::Python {
            // The code mount is read-only and output must not sit in a buffer
            env.push("PYTHONDONTWRITEBYTECODE=1".to_string());
            env.push("PYTHONUNBUFFERED=1".to_string());
        }

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (FUNCTION_LABEL.to_string(), function.id.to_string()),
            (REQUEST_LABEL.to_string(), request_id.to_string()),
        ]);

        SandboxSpec {
            name: format!("fnrun-{}-{}", function.id, request_id),
            image: config.images.image_for(function.language).to_string(),
            command: vec![function.language.interpreter().to_string(), entry_point],
            env,
            working_dir: config.sandbox_code_path.clone(),
            mounts: vec![BindMount {
                source: function.code_location.clone(),
                target: config.sandbox_code_path.clone(),
                read_only: true,
            }],
            limits: SandboxLimits {
                memory_bytes: config.limits.memory_bytes(),
                nano_cpus: config.limits.nano_cpus(),
                pids: config.limits.pids,
                network_disabled: config.limits.network_disabled,
            },
            labels,
        }
    }

    /// Verifies the handler, makes the base image available and creates the
    /// sandbox. Fails with `CodeNotFound`, `ImageUnavailable` or `ProvisionFailed`.
    #[instrument(skip(self, function, payload_json), fields(function_id = function.id))]
    pub async fn prepare(
        &self,
        function: &Function,
        payload_json: &str,
        request_id: &str,
    ) -> Result<SandboxGuard> {
        self.code.read(&function.handler_path()).await?;

        let spec = self.build_spec(function, payload_json, request_id);
        self.runtime
            .ensure_image(&spec.image, self.config.pull_missing_images)
            .await
            .map_err(FnrunError::from)?;

        let container_id = self
            .runtime
            .create(&spec)
            .await
            .map_err(FnrunError::from)?;
        debug!(%container_id, image = %spec.image, "Sandbox provisioned");

        Ok(SandboxGuard::new(
            self.runtime.clone(),
            container_id,
            self.config.teardown_grace(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_store::FsCodeStore;
    use crate::test_utils::{MockBehavior, MockRuntime};
    use chrono::Utc;
    use fnrun_common::ErrorKind;
    use std::path::PathBuf;

    fn function(location: PathBuf, language: Language) -> Function {
        let now = Utc::now();
        Function {
            id: 6,
            name: "echo".into(),
            route: "/echo".into(),
            language,
            code_location: location,
            timeout_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn provisioner(runtime: Arc<MockRuntime>) -> (SandboxProvisioner, FsCodeStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let code = FsCodeStore::open(dir.path()).await.unwrap();
        let provisioner = SandboxProvisioner::new(
            runtime,
            Arc::new(code.clone()),
            Arc::new(EngineConfig::default()),
        );
        (provisioner, code, dir)
    }

    #[tokio::test]
    async fn test_spec_layout() {
        let (provisioner, _code, _dir) = provisioner(Arc::new(MockRuntime::new())).await;
        let f = function(PathBuf::from("/srv/functions/6"), Language::Python);
        let spec = provisioner.build_spec(&f, r#"{"k":1}"#, "req-1");

        assert_eq!(spec.name, "fnrun-6-req-1");
        assert_eq!(spec.image, "python:3.11-alpine");
        assert_eq!(spec.command, vec!["python", "/function/handler.py"]);
        assert_eq!(spec.env[0], r#"PAYLOAD={"k":1}"#);
        assert_eq!(spec.mounts[0].to_bind_string(), "/srv/functions/6:/function:ro");
        assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(spec.labels.get(FUNCTION_LABEL).map(String::as_str), Some("6"));
        assert!(spec.limits.network_disabled);

        let js = function(PathBuf::from("/srv/functions/6"), Language::Javascript);
        let spec = provisioner.build_spec(&js, "null", "req-2");
        assert_eq!(spec.command, vec!["node", "/function/handler.js"]);
        assert_eq!(spec.image, "node:20-alpine");
        assert_eq!(spec.env, vec!["PAYLOAD=null"]);
    }

    #[tokio::test]
    async fn test_missing_code_is_detected_before_create() {
        let runtime = Arc::new(MockRuntime::new());
        let (provisioner, code, _dir) = provisioner(runtime.clone()).await;
        let f = function(code.location_for(6), Language::Python);

        let err = provisioner.prepare(&f, "{}", "req").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodeNotFound);
        assert_eq!(runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn test_image_and_create_failures() {
        let runtime = Arc::new(MockRuntime::new());
        let (provisioner, code, _dir) = provisioner(runtime.clone()).await;
        let location = code
            .write_handler(6, Language::Python, b"print('{}')")
            .await
            .unwrap();
        let f = function(location, Language::Python);

        runtime.set_default(MockBehavior::ImageMissing);
        let err = provisioner.prepare(&f, "{}", "req").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageUnavailable);

        runtime.set_default(MockBehavior::CreateRejected("no space left".into()));
        let err = provisioner.prepare(&f, "{}", "req").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProvisionFailed);
        assert_eq!(runtime.created_count(), 0);

        runtime.set_default(MockBehavior::json(serde_json::json!({})));
        let guard = provisioner.prepare(&f, "{}", "req").await.unwrap();
        assert_eq!(runtime.created_count(), 1);
        guard.reap().await;
        assert_eq!(runtime.live_count(), 0);
    }
}
