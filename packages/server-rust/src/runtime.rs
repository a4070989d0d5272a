//! The set of spaces hosted by one process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use spaceport_core::document;
use spaceport_core::naming::is_valid_namespace;

use crate::api::DESCRIPTOR_FILE as API_DESCRIPTOR;
use crate::config::RuntimeConfig;
use crate::describe::DescribeOptions;
use crate::error::ManagementError;
use crate::plugins::{Event, Subject};
use crate::space::{HostServices, SpaceHost, DESCRIPTOR_FILE as SPACE_DESCRIPTOR};

pub struct Runtime {
    config: Arc<RuntimeConfig>,
    host: HostServices,
    spaces: DashMap<String, Arc<SpaceHost>>,
    // Serializes create and drop.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Runtime {
    /// Creates an empty runtime without scanning the root.
    #[must_use]
    pub fn new(config: RuntimeConfig, host: HostServices) -> Self {
        Self {
            config: Arc::new(config),
            host,
            spaces: DashMap::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Loads every space under `<root>/spaces`, installs the apis found in
    /// each and starts the spaces that aren't blocked. Spaces that can't be
    /// loaded are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the spaces folder can't be created or read.
    pub async fn boot(config: RuntimeConfig, host: HostServices) -> Result<Self, ManagementError> {
        let runtime = Self::new(config, host);
        let spaces_dir = runtime.config.spaces_dir();
        std::fs::create_dir_all(&spaces_dir)?;

        for home in subfolders(&spaces_dir)? {
            let file = home.join(SPACE_DESCRIPTOR);
            if !file.is_file() {
                continue;
            }
            let space = match document::load(&file)
                .map_err(ManagementError::from)
                .and_then(|descriptor| {
                    SpaceHost::open(&home, descriptor, Arc::clone(&runtime.config), runtime.host.clone())
                }) {
                Ok(space) => Arc::new(space),
                Err(e) => {
                    tracing::error!(home = %home.display(), error = %e, "failed to load space");
                    continue;
                }
            };
            install_all(&space).await;
            if space.is_blocked() {
                tracing::warn!(space = %space.namespace(), "space is blocked, not starting");
            } else {
                space.start().await;
            }
            runtime.spaces.insert(space.namespace().to_string(), space);
        }
        tracing::info!(root = %runtime.config.root.display(), spaces = runtime.spaces.len(), "runtime booted");
        Ok(runtime)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn space(&self, namespace: &str) -> Option<Arc<SpaceHost>> {
        self.spaces.get(namespace).map(|e| Arc::clone(e.value()))
    }

    /// Hosted spaces ordered by namespace.
    #[must_use]
    pub fn spaces(&self) -> Vec<Arc<SpaceHost>> {
        let mut spaces: Vec<Arc<SpaceHost>> = self.spaces.iter().map(|e| Arc::clone(e.value())).collect();
        spaces.sort_by(|a, b| a.namespace().cmp(b.namespace()));
        spaces
    }

    /// Creates, saves and starts a new space. Plugins may veto the
    /// creation, in which case nothing is left on disk.
    ///
    /// # Errors
    ///
    /// [`ManagementError::InvalidNamespace`],
    /// [`ManagementError::SpaceExists`] or [`ManagementError::Plugin`].
    pub async fn create(&self, descriptor: Value) -> Result<Arc<SpaceHost>, ManagementError> {
        let namespace = document::get_str(&descriptor, "namespace")
            .unwrap_or_default()
            .to_string();
        if !is_valid_namespace(&namespace) {
            return Err(ManagementError::InvalidNamespace(namespace));
        }
        let _guard = self.lifecycle.lock().await;
        let home = self.config.spaces_dir().join(&namespace);
        if self.spaces.contains_key(&namespace) || home.exists() {
            return Err(ManagementError::SpaceExists(namespace));
        }

        let space = Arc::new(SpaceHost::open(
            &home,
            descriptor,
            Arc::clone(&self.config),
            self.host.clone(),
        )?);
        let descriptor = space.descriptor();
        let subject = Subject::Space {
            namespace: &namespace,
            descriptor: &descriptor,
        };
        if let Err(e) = self.host.plugins.on_event(Event::Create, &subject).await {
            space.shutdown().await;
            remove_space_home(&home);
            return Err(ManagementError::Plugin(e));
        }
        space.save().await?;
        if !space.is_blocked() {
            space.start().await;
        }
        self.spaces.insert(namespace.clone(), Arc::clone(&space));
        tracing::info!(space = %namespace, "space created");
        Ok(space)
    }

    /// Stops a space and deletes it with all its apis.
    ///
    /// # Errors
    ///
    /// [`ManagementError::SpaceNotFound`] or [`ManagementError::Plugin`] if
    /// a plugin vetoes the drop.
    pub async fn drop(&self, namespace: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        let space = self.require(namespace)?;
        let descriptor = space.descriptor();
        self.host
            .plugins
            .on_event(
                Event::Drop,
                &Subject::Space {
                    namespace,
                    descriptor: &descriptor,
                },
            )
            .await
            .map_err(ManagementError::Plugin)?;

        self.spaces.remove(namespace);
        space.shutdown().await;
        remove_space_home(space.home());
        tracing::info!(space = namespace, "space dropped");
        Ok(())
    }

    /// # Errors
    ///
    /// See [`SpaceHost::alter`].
    pub async fn alter(&self, namespace: &str, change: &Value) -> Result<(), ManagementError> {
        self.require(namespace)?.alter(change).await
    }

    /// # Errors
    ///
    /// [`ManagementError::SpaceNotFound`].
    pub async fn restart(&self, namespace: &str) -> Result<(), ManagementError> {
        self.require(namespace)?.restart().await;
        Ok(())
    }

    /// Refreshes the space named by the descriptor's `namespace`.
    ///
    /// # Errors
    ///
    /// See [`SpaceHost::refresh`].
    pub async fn refresh(&self, descriptor: &Value) -> Result<(), ManagementError> {
        let namespace = document::get_str(descriptor, "namespace").unwrap_or_default();
        self.require(namespace)?.refresh(descriptor).await
    }

    pub fn describe(&self, options: &DescribeOptions) -> Value {
        Value::Array(self.spaces().iter().map(|space| space.describe(options)).collect())
    }

    /// Stops every space, flushing their status.
    pub async fn shutdown(&self) {
        for space in self.spaces() {
            space.shutdown().await;
        }
        tracing::info!("runtime stopped");
    }

    fn require(&self, namespace: &str) -> Result<Arc<SpaceHost>, ManagementError> {
        self.space(namespace)
            .ok_or_else(|| ManagementError::SpaceNotFound(namespace.to_string()))
    }
}

/// Installs every folder of the space holding an api descriptor.
async fn install_all(space: &SpaceHost) {
    let homes = match subfolders(space.home()) {
        Ok(homes) => homes,
        Err(e) => {
            tracing::error!(space = %space.namespace(), error = %e, "failed to list api homes");
            return;
        }
    };
    for home in homes.into_iter().filter(|h| h.join(API_DESCRIPTOR).is_file()) {
        if let Err(e) = space.install_dir(&home).await {
            tracing::error!(space = %space.namespace(), home = %home.display(), error = %e, "failed to install api");
        }
    }
}

fn subfolders(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            folders.push(path);
        }
    }
    folders.sort();
    Ok(folders)
}

fn remove_space_home(home: &Path) {
    if let Err(e) = std::fs::remove_dir_all(home) {
        tracing::warn!(home = %home.display(), error = %e, "failed to remove space home");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::api::testing::write_api;
    use crate::plugins::{Plugin, PluginSet};
    use crate::space::testing::config;
    use spaceport_core::Status;

    struct Gatekeeper;

    #[async_trait]
    impl Plugin for Gatekeeper {
        fn name(&self) -> &str {
            "gatekeeper"
        }

        async fn on_event(&self, event: Event, subject: &Subject<'_>) -> anyhow::Result<()> {
            if let Subject::Space { namespace, .. } = subject {
                if namespace.starts_with("forbidden") && matches!(event, Event::Create) {
                    anyhow::bail!("{namespace} is not allowed");
                }
                if namespace.starts_with("pinned") && matches!(event, Event::Drop) {
                    anyhow::bail!("{namespace} can't be dropped");
                }
            }
            Ok(())
        }
    }

    fn gated() -> HostServices {
        HostServices {
            plugins: Arc::new(PluginSet::new().with(Arc::new(Gatekeeper))),
            ..HostServices::default()
        }
    }

    fn runtime(root: &Path, host: HostServices) -> Runtime {
        Runtime::new((*config(root)).clone(), host)
    }

    #[tokio::test]
    async fn create_and_drop_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path(), gated());

        let space = runtime.create(json!({"namespace": "acme"})).await.unwrap();
        assert!(space.is_started());
        assert!(space.home().join(SPACE_DESCRIPTOR).is_file());
        assert!(matches!(
            runtime.create(json!({"namespace": "acme"})).await,
            Err(ManagementError::SpaceExists(_))
        ));
        assert!(matches!(
            runtime.create(json!({"namespace": "not valid"})).await,
            Err(ManagementError::InvalidNamespace(_))
        ));

        runtime.drop("acme").await.unwrap();
        assert!(runtime.space("acme").is_none());
        assert!(!dir.path().join("spaces/acme").exists());
        assert!(matches!(runtime.drop("acme").await, Err(ManagementError::SpaceNotFound(_))));
    }

    #[tokio::test]
    async fn plugins_veto_create_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path(), gated());

        let err = runtime.create(json!({"namespace": "forbidden"})).await.err().unwrap();
        assert!(matches!(err, ManagementError::Plugin(_)));
        assert!(!dir.path().join("spaces/forbidden").exists());
        assert!(runtime.spaces().is_empty());

        runtime.create(json!({"namespace": "pinned"})).await.unwrap();
        assert!(runtime.drop("pinned").await.is_err());
        assert!(runtime.space("pinned").unwrap().is_started());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn boot_installs_apis_and_skips_blocked_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let spaces = dir.path().join("spaces");
        for (ns, blocked) in [("live", false), ("frozen", true)] {
            let home = spaces.join(ns);
            std::fs::create_dir_all(&home).unwrap();
            document::store(&home.join(SPACE_DESCRIPTOR), &json!({"namespace": ns, "blocked": blocked})).unwrap();
            write_api(&home, "shop", &json!({"namespace": "shop"}), &[]);
        }
        std::fs::create_dir_all(spaces.join("not-a-space")).unwrap();

        let runtime = Runtime::boot((*config(dir.path())).clone(), HostServices::default())
            .await
            .unwrap();
        let names: Vec<String> = runtime.spaces().iter().map(|s| s.namespace().to_string()).collect();
        assert_eq!(names, vec!["frozen", "live"]);
        assert!(runtime.space("live").unwrap().is_started());
        assert!(!runtime.space("frozen").unwrap().is_started());
        assert_eq!(
            runtime.space("live").unwrap().api("shop").unwrap().status(),
            Status::Stopped
        );
        assert_eq!(runtime.describe(&DescribeOptions::default()).as_array().unwrap().len(), 2);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn alter_and_refresh_reach_the_space() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path(), HostServices::default());
        runtime.create(json!({"namespace": "acme"})).await.unwrap();

        runtime.alter("acme", &json!({"limit": 5})).await.unwrap();
        runtime
            .refresh(&json!({"namespace": "acme", "secrets": {"s": {"k": 1}}}))
            .await
            .unwrap();
        let space = runtime.space("acme").unwrap();
        assert_eq!(space.descriptor()["runtime"]["limit"], 5);
        assert_eq!(space.secrets("s"), Some(json!({"k": 1})));
        runtime.restart("acme").await.unwrap();
        assert!(matches!(
            runtime.alter("nope", &json!({})).await,
            Err(ManagementError::SpaceNotFound(_))
        ));
        runtime.shutdown().await;
    }
}
