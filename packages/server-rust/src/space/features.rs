//! Features, secrets and runtime settings kept in the space descriptor.
//!
//! Features live under `features.<kind>.<name>` as `{provider, spec}`;
//! secrets under `secrets.<name>`. Every mutation is saved to `space.json`.

use serde_json::{Map, Value};
use spaceport_core::{document, ApiContext, FeatureInstance};

use super::SpaceHost;
use crate::error::ManagementError;
use crate::plugins::{Event, FeatureDescriptor, Subject};

const FEATURES: &str = "features";
const SECRETS: &str = "secrets";
const RUNTIME: &str = "runtime";

impl SpaceHost {
    /// Declared features ordered by kind and name.
    #[must_use]
    pub fn features(&self) -> Vec<FeatureDescriptor> {
        features_of(&self.descriptor())
    }

    #[must_use]
    pub fn feature_descriptor(&self, kind: &str, name: &str) -> Option<FeatureDescriptor> {
        let descriptor = self.descriptor();
        let kinds = document::get_object(&descriptor, FEATURES)?;
        let entry = kinds.get(&kind_key(kinds, kind)?)?.get(name)?;
        Some(to_feature(kind, name, entry))
    }

    /// Declares a feature and notifies its provider, which may reject it.
    ///
    /// # Errors
    ///
    /// [`ManagementError::FeatureExists`] unless `overwrite`,
    /// [`ManagementError::ProviderNotFound`] and
    /// [`ManagementError::Plugin`] when the provider rejects the feature.
    pub async fn add_feature(&self, feature: FeatureDescriptor, overwrite: bool) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.add_feature_locked(feature, overwrite).await?;
        self.save().await
    }

    async fn add_feature_locked(&self, mut feature: FeatureDescriptor, overwrite: bool) -> Result<(), ManagementError> {
        feature.kind = feature.kind.to_lowercase();
        feature.provider = feature.provider.to_lowercase();
        if !overwrite && self.feature_descriptor(&feature.kind, &feature.name).is_some() {
            return Err(ManagementError::FeatureExists {
                space: self.namespace.clone(),
                kind: feature.kind,
                name: feature.name,
            });
        }
        let provider = self
            .host
            .plugins
            .plugin(&feature.provider)
            .ok_or_else(|| ManagementError::ProviderNotFound(feature.provider.clone()))?;
        provider
            .on_event(
                Event::AddFeature,
                &Subject::Feature {
                    space: &self.namespace,
                    feature: &feature,
                },
            )
            .await
            .map_err(ManagementError::Plugin)?;

        self.update_descriptor(|d| {
            if let Some(root) = d.as_object_mut() {
                update_object(root, FEATURES, |kinds| {
                    let stored = kind_key(kinds, &feature.kind).unwrap_or_else(|| feature.kind.clone());
                    update_object(kinds, &stored, |names| {
                        names.insert(feature.name.clone(), from_feature(&feature));
                    });
                });
            }
        });
        tracing::info!(
            space = %self.namespace,
            kind = %feature.kind,
            name = %feature.name,
            provider = %feature.provider,
            "feature added"
        );
        Ok(())
    }

    /// Removes a feature. Provider faults are logged; the feature is gone
    /// regardless.
    ///
    /// # Errors
    ///
    /// [`ManagementError::FeatureNotFound`].
    pub async fn delete_feature(&self, kind: &str, name: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.delete_feature_locked(&kind.to_lowercase(), name).await?;
        self.save().await
    }

    async fn delete_feature_locked(&self, kind: &str, name: &str) -> Result<(), ManagementError> {
        let feature = self
            .feature_descriptor(kind, name)
            .ok_or_else(|| ManagementError::FeatureNotFound {
                space: self.namespace.clone(),
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        self.update_descriptor(|d| {
            let Some(kinds) = d.get_mut(FEATURES).and_then(Value::as_object_mut) else {
                return;
            };
            let Some(stored) = kind_key(kinds, kind) else {
                return;
            };
            if let Some(names) = kinds.get_mut(&stored).and_then(Value::as_object_mut) {
                names.remove(name);
                if names.is_empty() {
                    kinds.remove(&stored);
                }
            }
        });

        match self.host.plugins.plugin(&feature.provider) {
            Some(provider) => {
                let subject = Subject::Feature {
                    space: &self.namespace,
                    feature: &feature,
                };
                if let Err(e) = provider.on_event(Event::DeleteFeature, &subject).await {
                    tracing::warn!(space = %self.namespace, kind, name, error = %e, "provider failed to delete feature");
                }
            }
            None => {
                tracing::warn!(space = %self.namespace, kind, name, provider = %feature.provider, "feature provider not found");
            }
        }
        tracing::info!(space = %self.namespace, kind, name, "feature deleted");
        Ok(())
    }

    /// Reconciles features with `descriptor` and replaces the secrets.
    /// Removed features are deleted first, then changed ones are
    /// overwritten and new ones added.
    ///
    /// # Errors
    ///
    /// Stops at the first feature a provider rejects; changes applied
    /// before it are kept and saved.
    pub async fn refresh(&self, descriptor: &Value) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        let result = self.refresh_locked(descriptor).await;
        self.save().await?;
        result
    }

    async fn refresh_locked(&self, descriptor: &Value) -> Result<(), ManagementError> {
        let current = self.features();
        let wanted = features_of(descriptor);

        for feature in &current {
            if !wanted.iter().any(|w| same_feature(w, feature)) {
                self.delete_feature_locked(&feature.kind, &feature.name).await?;
            }
        }
        for feature in wanted {
            match current.iter().find(|c| same_feature(c, &feature)) {
                Some(existing) if *existing == feature => {}
                Some(_) => self.add_feature_locked(feature, true).await?,
                None => self.add_feature_locked(feature, false).await?,
            }
        }

        let secrets = descriptor.get(SECRETS).cloned();
        self.update_descriptor(|d| match (d.as_object_mut(), secrets) {
            (Some(obj), Some(secrets)) => {
                obj.insert(SECRETS.to_string(), secrets);
            }
            (Some(obj), None) => {
                obj.remove(SECRETS);
            }
            _ => {}
        });
        tracing::info!(space = %self.namespace, "space refreshed");
        Ok(())
    }

    // -- secrets -------------------------------------------------------------

    #[must_use]
    pub fn secrets(&self, name: &str) -> Option<Value> {
        self.descriptor().get(SECRETS)?.get(name).cloned()
    }

    /// Stores `secrets` under `name`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// [`ManagementError::MissingPayload`] on a `null` payload, or a save
    /// failure.
    pub async fn add_secrets(&self, name: &str, secrets: Value) -> Result<(), ManagementError> {
        if secrets.is_null() {
            return Err(ManagementError::MissingPayload("secrets"));
        }
        let _guard = self.lifecycle.lock().await;
        self.update_descriptor(|d| {
            if let Some(root) = d.as_object_mut() {
                update_object(root, SECRETS, |all| {
                    all.insert(name.to_string(), secrets);
                });
            }
        });
        self.save().await
    }

    /// Removes and returns the secrets stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor can't be saved.
    pub async fn delete_secrets(&self, name: &str) -> Result<Option<Value>, ManagementError> {
        let _guard = self.lifecycle.lock().await;
        let removed = self.secrets(name);
        if removed.is_some() {
            self.update_descriptor(|d| {
                if let Some(secrets) = d.get_mut(SECRETS).and_then(Value::as_object_mut) {
                    secrets.remove(name);
                }
            });
            self.save().await?;
        }
        Ok(removed)
    }

    // -- runtime -------------------------------------------------------------

    /// Merges `change` into the `runtime` section. Plugins see the updated
    /// descriptor first and may reject it.
    ///
    /// # Errors
    ///
    /// [`ManagementError::MissingPayload`] unless `change` is an object,
    /// [`ManagementError::Plugin`] if a plugin rejects the update.
    pub async fn alter(&self, change: &Value) -> Result<(), ManagementError> {
        if !change.is_object() {
            return Err(ManagementError::MissingPayload("runtime change"));
        }
        let _guard = self.lifecycle.lock().await;
        let mut updated = (*self.descriptor()).clone();
        match updated.get_mut(RUNTIME) {
            Some(runtime) => document::merge(runtime, change),
            None => document::set(&mut updated, RUNTIME, change.clone()),
        }
        self.host
            .plugins
            .on_event(
                Event::Update,
                &Subject::Space {
                    namespace: &self.namespace,
                    descriptor: &updated,
                },
            )
            .await
            .map_err(ManagementError::Plugin)?;
        self.update_descriptor(|d| *d = updated);
        tracing::info!(space = %self.namespace, "space runtime altered");
        self.save().await
    }

    // -- instances -----------------------------------------------------------

    /// Feature instance for a request context. Instances cached in `ctx`
    /// are reused; otherwise the provider creates one, and recyclable
    /// instances are cached in `ctx` until it is recycled.
    ///
    /// # Errors
    ///
    /// [`ManagementError::FeatureNotFound`],
    /// [`ManagementError::ProviderNotFound`] or
    /// [`ManagementError::Plugin`] when the provider fails.
    pub fn feature(&self, kind: &str, name: &str, ctx: &ApiContext) -> Result<FeatureInstance, ManagementError> {
        let kind = kind.to_lowercase();
        let key = format!("{}.{kind}.{name}", self.namespace);
        if let Some(instance) = ctx.get(&key) {
            return Ok(instance);
        }
        let feature = self
            .feature_descriptor(&kind, name)
            .ok_or_else(|| ManagementError::FeatureNotFound {
                space: self.namespace.clone(),
                kind: kind.clone(),
                name: name.to_string(),
            })?;
        let provider = self
            .host
            .plugins
            .plugin(&feature.provider)
            .ok_or_else(|| ManagementError::ProviderNotFound(feature.provider.clone()))?;
        let instance = provider
            .create_feature(&self.namespace, &feature)
            .map_err(ManagementError::Plugin)?;
        if instance.is_recyclable() {
            ctx.put(key, instance.clone());
        }
        Ok(instance)
    }
}

fn features_of(descriptor: &Value) -> Vec<FeatureDescriptor> {
    let Some(kinds) = document::get_object(descriptor, FEATURES) else {
        return Vec::new();
    };
    let mut features: Vec<FeatureDescriptor> = kinds
        .iter()
        .filter_map(|(kind, names)| Some((kind, names.as_object()?)))
        .flat_map(|(kind, names)| names.iter().map(move |(name, entry)| to_feature(kind, name, entry)))
        .collect();
    features.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
    features
}

fn to_feature(kind: &str, name: &str, entry: &Value) -> FeatureDescriptor {
    FeatureDescriptor {
        kind: kind.to_lowercase(),
        name: name.to_string(),
        provider: document::get_str(entry, "provider").unwrap_or_default().to_lowercase(),
        spec: entry.get("spec").cloned().unwrap_or(Value::Null),
    }
}

fn from_feature(feature: &FeatureDescriptor) -> Value {
    let mut entry = Map::new();
    entry.insert("provider".into(), Value::String(feature.provider.clone()));
    if !feature.spec.is_null() {
        entry.insert("spec".into(), feature.spec.clone());
    }
    Value::Object(entry)
}

/// Stored key of `kind` under `features`; kinds are case-insensitive.
fn kind_key(kinds: &Map<String, Value>, kind: &str) -> Option<String> {
    let kind = kind.to_lowercase();
    kinds.keys().find(|k| k.to_lowercase() == kind).cloned()
}

fn same_feature(a: &FeatureDescriptor, b: &FeatureDescriptor) -> bool {
    a.kind == b.kind && a.name == b.name
}

/// Applies `change` to the object under `key`, which starts empty when
/// missing or not an object.
fn update_object(parent: &mut Map<String, Value>, key: &str, change: impl FnOnce(&mut Map<String, Value>)) {
    let mut obj = match parent.remove(key) {
        Some(Value::Object(obj)) => obj,
        _ => Map::new(),
    };
    change(&mut obj);
    parent.insert(key.to_string(), Value::Object(obj));
}
