//! Function catalogue: identity, route and name uniqueness, write-through persistence.

use crate::code_store::CodeStore;
use chrono::Utc;
use fnrun_common::{ErrorKind, FnrunError, Function, FunctionId, Language, Result};
use fnrun_store::FunctionStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

/// Registration of a handler that already exists on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFunction {
    pub name: String,
    pub route: String,
    pub language: Language,
    pub code_location: PathBuf,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Registration that ships the handler source along with the metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub route: String,
    pub language: Language,
    pub source: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Default)]
struct Catalog {
    by_id: BTreeMap<FunctionId, Function>,
    routes: HashMap<String, FunctionId>,
    names: HashMap<String, FunctionId>,
}

impl Catalog {
    fn check_free(&self, name: &str, route: &str, owner: Option<FunctionId>) -> Result<()> {
        if let Some(&holder) = self.routes.get(route) {
            if Some(holder) != owner {
                return Err(FnrunError::RouteConflict(format!(
                    "{route} is already served by function {holder}"
                )));
            }
        }
        if let Some(&holder) = self.names.get(name) {
            if Some(holder) != owner {
                return Err(FnrunError::AlreadyExists(format!(
                    "function name {name:?} is taken by function {holder}"
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, function: Function) {
        self.routes.insert(function.route.clone(), function.id);
        self.names.insert(function.name.clone(), function.id);
        self.by_id.insert(function.id, function);
    }

    fn remove(&mut self, id: FunctionId) -> Option<Function> {
        let function = self.by_id.remove(&id)?;
        self.routes.remove(&function.route);
        self.names.remove(&function.name);
        Some(function)
    }
}

pub struct FunctionRegistry {
    catalog: RwLock<Catalog>,
    next_id: AtomicU64,
    store: Arc<dyn FunctionStore>,
    code: Arc<dyn CodeStore>,
}

impl FunctionRegistry {
    pub fn new(store: Arc<dyn FunctionStore>, code: Arc<dyn CodeStore>) -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            next_id: AtomicU64::new(1),
            store,
            code,
        }
    }

    pub fn code_store(&self) -> &Arc<dyn CodeStore> {
        &self.code
    }

    /// Loads persisted functions into memory. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize> {
        let functions = self.store.load_functions().await?;
        let mut catalog = self.catalog.write().await;
        let mut restored = 0;
        for function in functions {
            if let Err(e) = catalog.check_free(&function.name, &function.route, None) {
                warn!(function_id = function.id, error = %e, "Skipping conflicting persisted function");
                continue;
            }
            self.next_id.fetch_max(function.id + 1, Ordering::SeqCst);
            catalog.insert(function);
            restored += 1;
        }
        // Deleted ids still own metric history, so never hand them out again
        let highest = self.store.highest_id().await?;
        self.next_id.fetch_max(highest + 1, Ordering::SeqCst);
        info!(restored, next_id = self.next_id.load(Ordering::SeqCst), "Function registry restored");
        Ok(restored)
    }

    fn allocate_id(&self, catalog: &Catalog) -> FunctionId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if !catalog.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    #[instrument(skip(self, new), fields(name = %new.name, route = %new.route))]
    pub async fn register(&self, new: NewFunction) -> Result<Function> {
        let name = validate_name(&new.name)?;
        let route = normalize_route(&new.route)?;
        let code_location = tokio::fs::canonicalize(&new.code_location)
            .await
            .unwrap_or(new.code_location);

        let mut catalog = self.catalog.write().await;
        catalog.check_free(&name, &route, None)?;
        let id = self.allocate_id(&catalog);
        let now = Utc::now();
        let function = Function {
            id,
            name,
            route,
            language: new.language,
            code_location,
            timeout_ms: new.timeout_ms,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_function(&function).await?;
        catalog.insert(function.clone());
        info!(function_id = id, "Function registered");
        Ok(function)
    }

    #[instrument(skip(self, deployment), fields(name = %deployment.name, route = %deployment.route))]
    pub async fn deploy(&self, deployment: Deployment) -> Result<Function> {
        let name = validate_name(&deployment.name)?;
        let route = normalize_route(&deployment.route)?;

        let mut catalog = self.catalog.write().await;
        catalog.check_free(&name, &route, None)?;
        let (id, code_location) = loop {
            let id = self.allocate_id(&catalog);
            match self
                .code
                .create_handler(id, deployment.language, deployment.source.as_bytes())
                .await
            {
                Ok(location) => break (id, location),
                // Unregistered code on disk; left for adopt_existing
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!(function_id = id, error = %e, "Skipping id with code already on disk");
                }
                Err(e) => return Err(e),
            }
        };

        let now = Utc::now();
        let function = Function {
            id,
            name,
            route,
            language: deployment.language,
            code_location,
            timeout_ms: deployment.timeout_ms,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.upsert_function(&function).await {
            if let Err(cleanup) = self.code.remove(&function.code_location).await {
                warn!(function_id = id, error = %cleanup, "Failed to remove code of unsaved function");
            }
            return Err(e.into());
        }
        catalog.insert(function.clone());
        info!(function_id = id, "Function deployed");
        Ok(function)
    }

    #[instrument(skip(self, update))]
    pub async fn update(&self, id: FunctionId, update: FunctionUpdate) -> Result<Function> {
        let mut catalog = self.catalog.write().await;
        let current = catalog
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))?;

        let mut next = current.clone();
        if let Some(name) = update.name.as_deref() {
            next.name = validate_name(name)?;
        }
        if let Some(route) = update.route.as_deref() {
            next.route = normalize_route(route)?;
        }
        if let Some(language) = update.language {
            next.language = language;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            next.timeout_ms = Some(timeout_ms);
        }
        catalog.check_free(&next.name, &next.route, Some(id))?;

        if update.source.is_some() {
            next.code_location = self.code.location_for(id);
        } else if next.language != current.language {
            self.code.read(&next.handler_path()).await?;
        }
        next.updated_at = Utc::now().max(current.updated_at);

        // The row goes first so a failed store write leaves the live handler untouched
        self.store.upsert_function(&next).await?;
        if let Some(source) = update.source.as_deref() {
            if let Err(e) = self
                .code
                .write_handler(id, next.language, source.as_bytes())
                .await
            {
                if let Err(revert) = self.store.upsert_function(&current).await {
                    error!(function_id = id, error = %revert, "Failed to restore function row after handler write failed");
                }
                return Err(e);
            }
        }
        catalog.remove(id);
        catalog.insert(next.clone());
        info!(function_id = id, "Function updated");
        Ok(next)
    }

    /// Unregisters a function. Its code directory is removed best-effort.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: FunctionId) -> Result<Function> {
        let mut catalog = self.catalog.write().await;
        if !catalog.by_id.contains_key(&id) {
            return Err(not_found(id));
        }
        self.store.delete_function(id).await?;
        let removed = catalog.remove(id).ok_or_else(|| not_found(id))?;
        drop(catalog);

        if let Err(e) = self.code.remove(&removed.code_location).await {
            warn!(function_id = id, error = %e, "Failed to remove function code");
        }
        info!(function_id = id, "Function deleted");
        Ok(removed)
    }

    /// Registers a handler already present at the code store's location for `id`,
    /// keeping that id.
    #[instrument(skip(self))]
    pub async fn adopt_existing(
        &self,
        id: FunctionId,
        name: &str,
        route: &str,
        language: Language,
    ) -> Result<Function> {
        let name = validate_name(name)?;
        let route = normalize_route(route)?;

        let mut catalog = self.catalog.write().await;
        if catalog.by_id.contains_key(&id) {
            return Err(FnrunError::AlreadyExists(format!("function {id}")));
        }
        catalog.check_free(&name, &route, None)?;

        let code_location = self.code.location_for(id);
        self.code
            .read(&code_location.join(language.handler_file()))
            .await?;

        let now = Utc::now();
        let function = Function {
            id,
            name,
            route,
            language,
            code_location,
            timeout_ms: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_function(&function).await?;
        catalog.insert(function.clone());
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        info!(function_id = id, "Adopted existing function code");
        Ok(function)
    }

    pub async fn lookup(&self, id: FunctionId) -> Result<Function> {
        self.catalog
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    pub async fn lookup_route(&self, route: &str) -> Result<Function> {
        let route = normalize_route(route)?;
        let catalog = self.catalog.read().await;
        catalog
            .routes
            .get(&route)
            .and_then(|id| catalog.by_id.get(id))
            .cloned()
            .ok_or_else(|| FnrunError::NotFound(format!("no function serves {route}")))
    }

    pub async fn contains(&self, id: FunctionId) -> bool {
        self.catalog.read().await.by_id.contains_key(&id)
    }

    /// All functions, ordered by id.
    pub async fn list(&self) -> Vec<Function> {
        self.catalog.read().await.by_id.values().cloned().collect()
    }
}

fn not_found(id: FunctionId) -> FnrunError {
    FnrunError::NotFound(format!("function {id}"))
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FnrunError::InvalidRequest(
            "function name must not be empty".into(),
        ));
    }
    Ok(name.to_string())
}

/// Canonical form of a route: leading `/`, no trailing `/` (except the root),
/// restricted to URL-safe path characters.
pub fn normalize_route(route: &str) -> Result<String> {
    let trimmed = route.trim();
    if trimmed.is_empty() {
        return Err(FnrunError::InvalidRoute("route must not be empty".into()));
    }
    let body = trimmed.trim_matches('/');
    if let Some(bad) = body
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '~')))
    {
        return Err(FnrunError::InvalidRoute(format!(
            "{trimmed:?} contains disallowed character {bad:?}"
        )));
    }
    if body
        .split('/')
        .any(|seg| (seg.is_empty() && !body.is_empty()) || seg == "..")
    {
        return Err(FnrunError::InvalidRoute(format!(
            "{trimmed:?} has an empty or parent segment"
        )));
    }
    Ok(format!("/{body}"))
}
