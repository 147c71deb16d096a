//! Engine configuration: defaults, JSON file loading and `FNRUN_*` overrides.

use fnrun_common::{FnrunError, Language, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "FNRUN_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for deployed handler code, one subdirectory per function.
    pub functions_dir: PathBuf,
    /// Where the code directory is mounted inside a sandbox.
    pub sandbox_code_path: String,
    pub payload_env_var: String,
    pub images: RuntimeImages,
    pub pull_missing_images: bool,
    pub limits: ResourceLimits,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Upper bound on each teardown step (kill, log capture, removal).
    pub teardown_grace_ms: u64,
    pub max_concurrent_sandboxes: usize,
    /// Invocations allowed to wait for a slot; 0 rejects immediately when full.
    pub max_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            functions_dir: PathBuf::from("./functions"),
            sandbox_code_path: "/function".to_string(),
            payload_env_var: "PAYLOAD".to_string(),
            images: RuntimeImages::default(),
            pull_missing_images: true,
            limits: ResourceLimits::default(),
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            teardown_grace_ms: 5_000,
            max_concurrent_sandboxes: 8,
            max_queue_depth: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeImages {
    pub python: String,
    pub javascript: String,
}

impl Default for RuntimeImages {
    fn default() -> Self {
        Self {
            python: "python:3.11-alpine".to_string(),
            javascript: "node:20-alpine".to_string(),
        }
    }
}

impl RuntimeImages {
    pub fn image_for(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python,
            Language::Javascript => &self.javascript,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: i64,
    pub network_disabled: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpus: 0.5,
            pids: 64,
            network_disabled: true,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64).saturating_mul(1024 * 1024)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

impl EngineConfig {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                FnrunError::Config(format!("invalid config file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Full startup load: optional file from `FNRUN_CONFIG`, then env overrides, then validation.
    pub async fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(path).await?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `FNRUN_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("FNRUN_FUNCTIONS_DIR") {
            self.functions_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_override(&lookup, "FNRUN_MAX_CONCURRENCY")? {
            self.max_concurrent_sandboxes = v;
        }
        if let Some(v) = parse_override(&lookup, "FNRUN_MAX_QUEUE_DEPTH")? {
            self.max_queue_depth = v;
        }
        if let Some(v) = parse_override(&lookup, "FNRUN_DEFAULT_TIMEOUT_MS")? {
            self.default_timeout_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "FNRUN_MEMORY_MB")? {
            self.limits.memory_mb = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sandboxes == 0 {
            return Err(FnrunError::Config(
                "max_concurrent_sandboxes must be at least 1".into(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(FnrunError::Config("default_timeout_ms must be positive".into()));
        }
        if self.max_timeout_ms < self.default_timeout_ms {
            return Err(FnrunError::Config(format!(
                "max_timeout_ms ({}) is below default_timeout_ms ({})",
                self.max_timeout_ms, self.default_timeout_ms
            )));
        }
        if self.limits.memory_mb < 6 {
            // Docker refuses anything below 6 MiB
            return Err(FnrunError::Config("limits.memory_mb must be at least 6".into()));
        }
        if self.limits.cpus.is_nan() || self.limits.cpus <= 0.0 {
            return Err(FnrunError::Config("limits.cpus must be positive".into()));
        }
        if self.limits.pids <= 0 {
            return Err(FnrunError::Config("limits.pids must be positive".into()));
        }
        if !self.sandbox_code_path.starts_with('/') {
            return Err(FnrunError::Config(
                "sandbox_code_path must be an absolute container path".into(),
            ));
        }
        if self.payload_env_var.is_empty() || self.payload_env_var.contains('=') {
            return Err(FnrunError::Config(format!(
                "invalid payload_env_var {:?}",
                self.payload_env_var
            )));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Request timeout wins over the function's own, which wins over the default.
    /// The result is clamped to `[1ms, max_timeout]`.
    pub fn effective_timeout(
        &self,
        requested: Option<Duration>,
        function_default: Option<Duration>,
    ) -> Duration {
        requested
            .or(function_default)
            .unwrap_or_else(|| self.default_timeout())
            .clamp(Duration::from_millis(1), self.max_timeout())
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| FnrunError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.images.image_for(Language::Python), "python:3.11-alpine");
        assert_eq!(config.limits.memory_bytes(), 128 * 1024 * 1024);
        assert_eq!(config.limits.nano_cpus(), 500_000_000);
    }

    #[test]
    fn test_timeout_precedence_and_clamp() {
        let config = EngineConfig::default();
        let fn_default = Some(Duration::from_secs(2));
        assert_eq!(
            config.effective_timeout(Some(Duration::from_millis(1)), fn_default),
            Duration::from_millis(1)
        );
        assert_eq!(config.effective_timeout(None, fn_default), Duration::from_secs(2));
        assert_eq!(config.effective_timeout(None, None), Duration::from_secs(30));
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(3600)), None),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.effective_timeout(Some(Duration::ZERO), None),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FNRUN_MAX_CONCURRENCY", "3"),
            ("FNRUN_MEMORY_MB", "256"),
            ("FNRUN_FUNCTIONS_DIR", "/srv/functions"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_concurrent_sandboxes, 3);
        assert_eq!(config.limits.memory_mb, 256);
        assert_eq!(config.functions_dir, PathBuf::from("/srv/functions"));
        assert_eq!(config.max_queue_depth, 0);

        let err = EngineConfig::default()
            .apply_overrides(|k| (k == "FNRUN_MAX_QUEUE_DEPTH").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, FnrunError::Config(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.max_concurrent_sandboxes = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_timeout_ms = 10;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sandbox_code_path = "function".into();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = EngineConfig::load_from_file(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(missing, EngineConfig::default());

        let path = dir.path().join("fnrun.json");
        tokio::fs::write(
            &path,
            r#"{"max_concurrent_sandboxes": 2, "limits": {"memory_mb": 64}}"#,
        )
        .await
        .unwrap();
        let config = EngineConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.max_concurrent_sandboxes, 2);
        assert_eq!(config.limits.memory_mb, 64);
        assert_eq!(config.limits.pids, 64);
        assert_eq!(config.default_timeout_ms, 30_000);

        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(EngineConfig::load_from_file(&path).await.is_err());
    }
}
