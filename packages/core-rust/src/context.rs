use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A resource whose lifetime ends with the request context that holds it.
pub trait Recyclable: Send + Sync {
    fn recycle(&self);
}

/// A feature instance handed out by a provider.
///
/// `recyclable` is set when the instance is scoped to one request context;
/// instances without it are long-lived and never cached in a context.
#[derive(Clone)]
pub struct FeatureInstance {
    pub instance: Arc<dyn Any + Send + Sync>,
    pub recyclable: Option<Arc<dyn Recyclable>>,
}

impl FeatureInstance {
    /// Wraps a long-lived instance.
    #[must_use]
    pub fn shared<T: Any + Send + Sync>(instance: Arc<T>) -> Self {
        Self {
            instance,
            recyclable: None,
        }
    }

    /// Wraps an instance released when its request context is recycled.
    #[must_use]
    pub fn recyclable<T: Any + Recyclable>(instance: Arc<T>) -> Self {
        Self {
            instance: instance.clone(),
            recyclable: Some(instance),
        }
    }

    /// Downcasts the instance to its concrete type.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance.clone().downcast::<T>().ok()
    }

    #[must_use]
    pub fn is_recyclable(&self) -> bool {
        self.recyclable.is_some()
    }
}

impl fmt::Debug for FeatureInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureInstance")
            .field("recyclable", &self.is_recyclable())
            .finish_non_exhaustive()
    }
}

/// Per-request context. Caches feature instances by key and releases the
/// recyclable ones when recycled or dropped.
pub struct ApiContext {
    id: String,
    entries: Mutex<HashMap<String, FeatureInstance>>,
    recycled: AtomicBool,
}

impl ApiContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Mutex::new(HashMap::new()),
            recycled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<FeatureInstance> {
        self.entries.lock().get(key).cloned()
    }

    /// Caches an instance under `key`. A different recyclable instance
    /// cached there before is recycled.
    pub fn put(&self, key: impl Into<String>, instance: FeatureInstance) {
        let key = key.into();
        let incoming = Arc::clone(&instance.instance);
        let replaced = self.entries.lock().insert(key.clone(), instance);
        let Some(previous) = replaced else {
            return;
        };
        if Arc::ptr_eq(&previous.instance, &incoming) {
            return;
        }
        if let Some(recyclable) = previous.recyclable {
            tracing::trace!(context = %self.id, key = %key, "recycling replaced feature");
            recyclable.recycle();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Releases every cached recyclable. Runs at most once.
    pub fn recycle(&self) {
        if self.recycled.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<(String, FeatureInstance)> = self.entries.lock().drain().collect();
        for (key, entry) in drained {
            if let Some(recyclable) = entry.recyclable {
                tracing::trace!(context = %self.id, key = %key, "recycling feature");
                recyclable.recycle();
            }
        }
    }
}

impl Default for ApiContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ApiContext {
    fn drop(&mut self) {
        self.recycle();
    }
}

impl fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiContext")
            .field("id", &self.id)
            .field("entries", &self.len())
            .finish()
    }
}
