//! Lifecycle observers and feature providers.
//!
//! Every registered [`Plugin`] sees space, api and feature events in
//! registration order. A plugin may also export a [`SymbolTable`] that apis
//! list as a dependency, and may act as the provider that creates feature
//! instances.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spaceport_core::FeatureInstance;

use crate::api::ApiHost;
use crate::spi::SymbolTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Create,
    Drop,
    Install,
    Uninstall,
    Start,
    Stop,
    AddFeature,
    DeleteFeature,
    Update,
}

/// A named capability declared in a space's `features` section, created on
/// demand by the plugin registered as its `provider`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub kind: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub spec: Value,
}

/// What an event is about.
pub enum Subject<'a> {
    Space { namespace: &'a str, descriptor: &'a Value },
    Api(&'a ApiHost),
    Feature { space: &'a str, feature: &'a FeatureDescriptor },
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// An error vetoes operator actions (create, install) and fails api
    /// start.
    async fn on_event(&self, _event: Event, _subject: &Subject<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Symbols exported to apis that declare this plugin as a dependency.
    fn symbols(&self) -> Option<Arc<SymbolTable>> {
        None
    }

    /// # Errors
    ///
    /// Returns an error if this plugin can't provide `feature`.
    fn create_feature(&self, _space: &str, feature: &FeatureDescriptor) -> anyhow::Result<FeatureInstance> {
        anyhow::bail!(
            "plugin {} does not provide {} features",
            self.name(),
            feature.kind
        )
    }
}

#[async_trait]
pub trait PluginRegistry: Send + Sync {
    /// Notifies every plugin, stopping at the first error.
    async fn on_event(&self, event: Event, subject: &Subject<'_>) -> anyhow::Result<()>;

    /// Symbol table exported by the named plugin.
    fn find(&self, name: &str) -> Option<Arc<SymbolTable>>;

    fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>>;
}

/// Ordered in-process plugin registry.
#[derive(Default, Clone)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[async_trait]
impl PluginRegistry for PluginSet {
    async fn on_event(&self, event: Event, subject: &Subject<'_>) -> anyhow::Result<()> {
        for plugin in &self.plugins {
            plugin
                .on_event(event, subject)
                .await
                .with_context(|| format!("plugin {} rejected {event:?}", plugin.name()))?;
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<Arc<SymbolTable>> {
        self.plugin(name)?.symbols()
    }

    fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        veto: Option<Event>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_event(&self, event: Event, subject: &Subject<'_>) -> anyhow::Result<()> {
            if let Subject::Space { namespace, .. } = subject {
                self.seen.lock().push(format!("{}:{event:?}:{namespace}", self.name));
            }
            if self.veto == Some(event) {
                anyhow::bail!("vetoed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_reach_plugins_in_order_until_one_fails() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = PluginSet::new()
            .with(Arc::new(Recorder { name: "a", seen: Arc::clone(&seen), veto: Some(Event::Drop) }))
            .with(Arc::new(Recorder { name: "b", seen: Arc::clone(&seen), veto: None }));
        let descriptor = json!({});
        let subject = Subject::Space { namespace: "acme", descriptor: &descriptor };

        set.on_event(Event::Create, &subject).await.unwrap();
        let err = set.on_event(Event::Drop, &subject).await.unwrap_err();
        assert!(err.to_string().contains("plugin a rejected Drop"));

        assert_eq!(
            *seen.lock(),
            vec!["a:Create:acme", "b:Create:acme", "a:Drop:acme"]
        );
    }

    #[test]
    fn default_provider_refuses_features() {
        let set = PluginSet::new().with(Arc::new(Recorder {
            name: "db",
            seen: Arc::default(),
            veto: None,
        }));
        let plugin = set.plugin("db").unwrap();
        let feature = FeatureDescriptor {
            kind: "database".into(),
            name: "main".into(),
            provider: "db".into(),
            spec: Value::Null,
        };
        assert!(plugin.create_feature("acme", &feature).is_err());
        assert!(set.find("db").is_none());
        assert!(set.plugin("missing").is_none());
    }
}
