use crate::{MetricFilter, Result};
use async_trait::async_trait;
use fnrun_common::{Function, FunctionId, Metric};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Write side of the function catalogue.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn upsert_function(&self, function: &Function) -> Result<()>;
    async fn delete_function(&self, id: FunctionId) -> Result<()>;
    async fn load_functions(&self) -> Result<Vec<Function>>;
    /// Highest id ever stored, including deleted functions. Ids at or below
    /// it must not be handed out again, since metric rows still carry them.
    async fn highest_id(&self) -> Result<FunctionId>;
}

/// Append-only metric history. Implementations must accept concurrent inserts.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn insert_metric(&self, metric: &Metric) -> Result<()>;
    async fn query_metrics(
        &self,
        function_id: FunctionId,
        filter: &MetricFilter,
    ) -> Result<Vec<Metric>>;
}

// In-memory storage implementation for development/testing
#[derive(Default, Clone)]
pub struct InMemoryStore {
    functions: Arc<RwLock<BTreeMap<FunctionId, Function>>>,
    metrics: Arc<RwLock<HashMap<FunctionId, Vec<Metric>>>>,
    high_water: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn metric_count(&self) -> usize {
        self.metrics.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl FunctionStore for InMemoryStore {
    async fn upsert_function(&self, function: &Function) -> Result<()> {
        self.functions
            .write()
            .await
            .insert(function.id, function.clone());
        self.high_water.fetch_max(function.id, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_function(&self, id: FunctionId) -> Result<()> {
        self.functions.write().await.remove(&id);
        Ok(())
    }

    async fn load_functions(&self) -> Result<Vec<Function>> {
        Ok(self.functions.read().await.values().cloned().collect())
    }

    async fn highest_id(&self) -> Result<FunctionId> {
        Ok(self.high_water.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl MetricStore for InMemoryStore {
    async fn insert_metric(&self, metric: &Metric) -> Result<()> {
        self.metrics
            .write()
            .await
            .entry(metric.function_id)
            .or_default()
            .push(metric.clone());
        Ok(())
    }

    async fn query_metrics(
        &self,
        function_id: FunctionId,
        filter: &MetricFilter,
    ) -> Result<Vec<Metric>> {
        let metrics = self.metrics.read().await;
        Ok(metrics
            .get(&function_id)
            .map(|rows| filter.apply(rows))
            .unwrap_or_default())
    }
}
