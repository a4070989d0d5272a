//! Space hosting: one tenant's apis, features, secrets, keys and worker
//! pool.
//!
//! Lifecycle commands on a space are serialized by an async mutex; reads
//! (routing, describe) go through lock-free snapshots.

mod apis;
mod features;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use spaceport_core::naming::is_valid_namespace;
use spaceport_core::{document, Status};

use crate::api::{ApiEnv, ApiHost};
use crate::archive::{ArchiveCodec, TarGzCodec};
use crate::config::{ExecutorConfig, RuntimeConfig};
use crate::describe::{DescribeOption, DescribeOptions};
use crate::error::ManagementError;
use crate::executor::ExecutionEngine;
use crate::keystore::{strip_secret, KeyStore, KeyStoreProvider, MemoryKeyStoreProvider};
use crate::plugins::{PluginRegistry, PluginSet};
use crate::spi::{AcceptAll, LogTracer, RequestValidator, SymbolTable, Tracer};
use crate::status::{FileStatusStore, StatusStore};

pub const DESCRIPTOR_FILE: &str = "space.json";

/// Number of keys listed by `describe`.
const DESCRIBE_KEYS: usize = 100;

/// Collaborators shared by every space of a runtime.
#[derive(Clone)]
pub struct HostServices {
    pub plugins: Arc<dyn PluginRegistry>,
    pub symbols: Arc<SymbolTable>,
    pub validator: Arc<dyn RequestValidator>,
    pub tracer: Arc<dyn Tracer>,
    pub keystores: Option<Arc<dyn KeyStoreProvider>>,
    pub codec: Arc<dyn ArchiveCodec>,
}

impl Default for HostServices {
    fn default() -> Self {
        Self {
            plugins: Arc::new(PluginSet::new()),
            symbols: Arc::new(SymbolTable::new()),
            validator: Arc::new(AcceptAll),
            tracer: Arc::new(LogTracer),
            keystores: Some(Arc::new(MemoryKeyStoreProvider::default())),
            codec: Arc::new(TarGzCodec),
        }
    }
}

pub struct SpaceHost {
    namespace: String,
    home: PathBuf,
    config: Arc<RuntimeConfig>,
    host: HostServices,
    descriptor: ArcSwap<Value>,
    apis: DashMap<String, Arc<ApiHost>>,
    status: Arc<FileStatusStore>,
    engine: ExecutionEngine,
    keystore: Option<Arc<dyn KeyStore>>,
    lifecycle: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

impl SpaceHost {
    /// Opens a space rooted at `home`. Must be called inside a tokio
    /// runtime. The space isn't started.
    ///
    /// # Errors
    ///
    /// Fails on an invalid namespace, an unreadable status file or a
    /// keystore that can't be opened.
    pub fn open(
        home: impl Into<PathBuf>,
        descriptor: Value,
        config: Arc<RuntimeConfig>,
        host: HostServices,
    ) -> Result<Self, ManagementError> {
        let home = home.into();
        let namespace = document::get_str(&descriptor, "namespace")
            .unwrap_or_default()
            .to_string();
        if !is_valid_namespace(&namespace) {
            return Err(ManagementError::InvalidNamespace(namespace));
        }
        std::fs::create_dir_all(&home)?;

        let status = FileStatusStore::open(home.join(&config.status.file_name), &config.status)
            .map_err(ManagementError::StatusStore)?;
        let engine = ExecutionEngine::new(
            format!("space:{namespace}"),
            executor_config(&namespace, &descriptor, &config),
        );
        let keystore = host
            .keystores
            .as_ref()
            .map(|provider| provider.open(&namespace))
            .transpose()
            .map_err(ManagementError::Plugin)?;

        Ok(Self {
            namespace,
            home,
            config,
            host,
            descriptor: ArcSwap::from_pointee(descriptor),
            apis: DashMap::new(),
            status: Arc::new(status),
            engine,
            keystore,
            lifecycle: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Current descriptor snapshot.
    #[must_use]
    pub fn descriptor(&self) -> Arc<Value> {
        self.descriptor.load_full()
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        document::get_bool(&self.descriptor.load(), "blocked", false)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    #[must_use]
    pub fn status_store(&self) -> Arc<dyn StatusStore> {
        Arc::clone(&self.status) as Arc<dyn StatusStore>
    }

    #[must_use]
    pub fn keystore(&self) -> Option<&Arc<dyn KeyStore>> {
        self.keystore.as_ref()
    }

    #[must_use]
    pub fn api(&self, namespace: &str) -> Option<Arc<ApiHost>> {
        self.apis.get(namespace).map(|e| Arc::clone(e.value()))
    }

    /// Installed apis ordered by namespace.
    #[must_use]
    pub fn apis(&self) -> Vec<Arc<ApiHost>> {
        let mut apis: Vec<Arc<ApiHost>> = self.apis.iter().map(|e| Arc::clone(e.value())).collect();
        apis.sort_by(|a, b| a.namespace().cmp(b.namespace()));
        apis
    }

    fn api_env(&self) -> ApiEnv {
        ApiEnv {
            space: self.namespace.clone(),
            status: self.status_store(),
            plugins: Arc::clone(&self.host.plugins),
            symbols: Arc::clone(&self.host.symbols),
            validator: Arc::clone(&self.host.validator),
            tracer: Arc::clone(&self.host.tracer),
            default_language: self.config.default_language.clone(),
        }
    }

    // -- space lifecycle -----------------------------------------------------

    /// Starts the worker pool and restores every installed api to its
    /// persisted status.
    pub async fn start(&self) {
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await;
    }

    /// Stops every api without touching persisted status, drains the pool
    /// and flushes status.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    pub async fn restart(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await;
        self.start_locked().await;
    }

    /// Stops the space and the status flush worker.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.status.shutdown().await;
    }

    async fn start_locked(&self) {
        if self.is_started() {
            return;
        }
        self.engine.start();
        self.started.store(true, Ordering::Release);
        for api in self.apis() {
            if api.status() == Status::Stopped {
                self.restore(&api).await;
            }
        }
        tracing::info!(space = %self.namespace, apis = self.apis.len(), "space started");
    }

    async fn stop_locked(&self) {
        if !self.is_started() {
            return;
        }
        for api in self.apis() {
            if api.status().is_active() {
                api.stop(false).await;
            }
        }
        self.engine.shutdown().await;
        if let Err(e) = self.status.flush().await {
            tracing::error!(space = %self.namespace, error = %e, "status flush failed on stop");
        }
        self.started.store(false, Ordering::Release);
        tracing::info!(space = %self.namespace, "space stopped");
    }

    /// Starts `api` if its persisted status is `Running` or `Paused`.
    async fn restore(&self, api: &ApiHost) {
        let stored = self.status.get(api.namespace());
        tracing::debug!(space = %self.namespace, api = %api.namespace(), status = ?stored, "restoring api");
        match stored {
            Some(Status::Running) => {
                api.start(false).await;
            }
            Some(Status::Paused) => {
                api.start(true).await;
            }
            _ => {}
        }
    }

    /// Writes the descriptor to `space.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be written.
    pub async fn save(&self) -> Result<(), ManagementError> {
        let descriptor = self.descriptor();
        let file = self.home.join(DESCRIPTOR_FILE);
        tokio::task::spawn_blocking(move || document::store(&file, &descriptor))
            .await
            .map_err(|e| ManagementError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Replaces the descriptor with the result of `change` applied to a
    /// copy. Callers hold the lifecycle lock.
    fn update_descriptor(&self, change: impl FnOnce(&mut Value)) {
        let mut descriptor = (*self.descriptor.load_full()).clone();
        change(&mut descriptor);
        self.descriptor.store(Arc::new(descriptor));
    }

    pub fn describe(&self, options: &DescribeOptions) -> Value {
        let descriptor = self.descriptor();
        let mut out = Map::new();
        out.insert("namespace".into(), json!(self.namespace));
        for key in ["name", "description"] {
            if let Some(value) = descriptor.get(key) {
                out.insert(key.into(), value.clone());
            }
        }
        let status = if self.is_started() { Status::Running } else { Status::Stopped };
        out.insert("status".into(), json!(status));
        out.insert("blocked".into(), json!(self.is_blocked()));

        if options.has(DescribeOption::Keys) {
            if let Some(keystore) = &self.keystore {
                let keys: Vec<Value> = keystore
                    .list(0, DESCRIBE_KEYS)
                    .iter()
                    .map(|(_, key)| strip_secret(key))
                    .collect();
                out.insert("keys".into(), Value::Array(keys));
            }
        }
        for (option, key) in [
            (DescribeOption::Secrets, "secrets"),
            (DescribeOption::Features, "features"),
            (DescribeOption::Runtime, "runtime"),
        ] {
            if options.has(option) {
                out.insert(key.into(), descriptor.get(key).cloned().unwrap_or(Value::Null));
            }
        }
        if options.has(DescribeOption::Apis) {
            let apis: Vec<Value> = self.apis().iter().map(|api| api.describe(options)).collect();
            out.insert("apis".into(), Value::Array(apis));
        }
        if options.has(DescribeOption::Workers) {
            out.insert("workers".into(), json!(self.engine.describe()));
        }
        Value::Object(out)
    }
}

/// Pool settings for a space: its `executor` section when present (`null`
/// runs units inline), the runtime default otherwise.
fn executor_config(space: &str, descriptor: &Value, config: &RuntimeConfig) -> Option<ExecutorConfig> {
    match descriptor.get("executor") {
        None => config.executor.clone(),
        Some(Value::Null) => None,
        Some(section) => match serde_json::from_value::<ExecutorConfig>(section.clone()) {
            Ok(executor) => Some(executor),
            Err(e) => {
                tracing::warn!(space, error = %e, "invalid executor section, using defaults");
                config.executor.clone()
            }
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::Arc;

    use serde_json::json;

    use super::{HostServices, SpaceHost};
    use crate::config::{ExecutorConfig, RuntimeConfig};

    pub fn config(root: &Path) -> Arc<RuntimeConfig> {
        let mut config = RuntimeConfig::new(root);
        config.executor = Some(ExecutorConfig {
            core_size: 2,
            max_size: 2,
            queue: 4,
            timeout: 500,
            await_termination: 200,
            reject_wait: 100,
            ..ExecutorConfig::default()
        });
        Arc::new(config)
    }

    pub fn space(root: &Path, namespace: &str, host: HostServices) -> SpaceHost {
        let config = config(root);
        SpaceHost::open(
            config.spaces_dir().join(namespace),
            json!({"namespace": namespace}),
            config,
            host,
        )
        .unwrap()
    }
}
