//! File-backed store: a JSON snapshot of the function catalogue plus an
//! append-only JSON-lines metric log.

use crate::storage::{FunctionStore, MetricStore};
use crate::{MetricFilter, Result, StoreError};
use async_trait::async_trait;
use fnrun_common::{Function, FunctionId, Metric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

const FUNCTIONS_FILE: &str = "functions.json";
const METRICS_FILE: &str = "metrics.jsonl";

pub struct JsonFileStore {
    root: PathBuf,
    catalogue: Mutex<Catalogue>,
    metrics_log: Mutex<()>,
}

#[derive(Default)]
struct Catalogue {
    functions: BTreeMap<FunctionId, Function>,
    high_water_id: FunctionId,
}

/// On-disk layout of `functions.json`. A bare array is the older layout and
/// carries no high-water mark beyond its own ids.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Snapshot {
    Current {
        high_water_id: FunctionId,
        functions: Vec<Function>,
    },
    Legacy(Vec<Function>),
}

impl From<Snapshot> for Catalogue {
    fn from(snapshot: Snapshot) -> Self {
        let (recorded, list) = match snapshot {
            Snapshot::Current {
                high_water_id,
                functions,
            } => (high_water_id, functions),
            Snapshot::Legacy(functions) => (0, functions),
        };
        let functions: BTreeMap<_, _> = list.into_iter().map(|f| (f.id, f)).collect();
        let high_water_id = functions.keys().copied().max().unwrap_or(0).max(recorded);
        Self {
            functions,
            high_water_id,
        }
    }
}

impl JsonFileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let functions_path = root.join(FUNCTIONS_FILE);
        let catalogue = match tokio::fs::read(&functions_path).await {
            Ok(bytes) => Catalogue::from(serde_json::from_slice::<Snapshot>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalogue::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %root.display(),
            functions = catalogue.functions.len(),
            high_water_id = catalogue.high_water_id,
            "Opened file store"
        );

        Ok(Self {
            root,
            catalogue: Mutex::new(catalogue),
            metrics_log: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn persist_functions(&self, catalogue: &Catalogue) -> Result<()> {
        let snapshot = Snapshot::Current {
            high_water_id: catalogue.high_water_id,
            functions: catalogue.functions.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.root.join(format!("{FUNCTIONS_FILE}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.root.join(FUNCTIONS_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl FunctionStore for JsonFileStore {
    async fn upsert_function(&self, function: &Function) -> Result<()> {
        let mut catalogue = self.catalogue.lock().await;
        catalogue.functions.insert(function.id, function.clone());
        catalogue.high_water_id = catalogue.high_water_id.max(function.id);
        self.persist_functions(&catalogue).await
    }

    async fn delete_function(&self, id: FunctionId) -> Result<()> {
        let mut catalogue = self.catalogue.lock().await;
        if catalogue.functions.remove(&id).is_some() {
            self.persist_functions(&catalogue).await?;
        }
        Ok(())
    }

    async fn load_functions(&self) -> Result<Vec<Function>> {
        Ok(self
            .catalogue
            .lock()
            .await
            .functions
            .values()
            .cloned()
            .collect())
    }

    async fn highest_id(&self) -> Result<FunctionId> {
        Ok(self.catalogue.lock().await.high_water_id)
    }
}

#[async_trait]
impl MetricStore for JsonFileStore {
    async fn insert_metric(&self, metric: &Metric) -> Result<()> {
        let mut line = serde_json::to_vec(metric)?;
        line.push(b'\n');

        let _guard = self.metrics_log.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(METRICS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query_metrics(
        &self,
        function_id: FunctionId,
        filter: &MetricFilter,
    ) -> Result<Vec<Metric>> {
        let file = match tokio::fs::File::open(self.root.join(METRICS_FILE)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut rows = Vec::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Metric>(&line) {
                Ok(metric) if metric.function_id == function_id => rows.push(metric),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable metric line"),
            }
        }
        Ok(filter.apply(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fnrun_common::{ErrorKind, Language};

    fn function(id: FunctionId) -> Function {
        let now = Utc::now();
        Function {
            id,
            name: format!("fn-{id}"),
            route: format!("/fn-{id}"),
            language: Language::Javascript,
            code_location: PathBuf::from(format!("/srv/functions/{id}")),
            timeout_ms: Some(2000),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_functions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let kept = function(2);
        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store.upsert_function(&function(1)).await.unwrap();
            store.upsert_function(&kept).await.unwrap();
            store.delete_function(1).await.unwrap();
        }

        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load_functions().await.unwrap(), vec![kept]);
    }

    #[tokio::test]
    async fn test_high_water_id_survives_delete_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store.upsert_function(&function(1)).await.unwrap();
            store.upsert_function(&function(5)).await.unwrap();
            store.delete_function(5).await.unwrap();
        }

        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load_functions().await.unwrap().len(), 1);
        assert_eq!(store.highest_id().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_opens_bare_array_catalogue() {
        let dir = tempfile::tempdir().unwrap();
        let list = vec![function(4), function(2)];
        std::fs::write(
            dir.path().join(FUNCTIONS_FILE),
            serde_json::to_vec(&list).unwrap(),
        )
        .unwrap();

        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load_functions().await.unwrap().len(), 2);
        assert_eq!(store.highest_id().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_metric_log_appends_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(store
            .query_metrics(1, &MetricFilter::default())
            .await
            .unwrap()
            .is_empty());

        for (function_id, success) in [(1, true), (1, false), (2, true)] {
            let metric = Metric {
                request_id: uuid::Uuid::new_v4().to_string(),
                function_id,
                started_at: Utc::now(),
                duration_ms: 3.0,
                success,
                error_kind: (!success).then_some(ErrorKind::Crashed),
                error_message: None,
                exit_code: Some(if success { 0 } else { 1 }),
                payload_size: 2,
                response_size: 10,
                container_id: Some("abc".to_string()),
                memory_usage_mb: None,
                cpu_usage_percent: None,
            };
            store.insert_metric(&metric).await.unwrap();
        }

        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        let rows = reopened
            .query_metrics(1, &MetricFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let failed = reopened
            .query_metrics(
                1,
                &MetricFilter {
                    success: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_kind, Some(ErrorKind::Crashed));
    }
}
