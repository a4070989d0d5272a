//! Per-space key storage.
//!
//! Keys are JSON documents indexed by access key. The secret part of a key
//! (`secretKey`) is never exposed by `describe`.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

/// Field holding the secret half of a key pair.
pub const SECRET_FIELD: &str = "secretKey";

pub trait KeyStore: Send + Sync {
    fn get(&self, access_key: &str) -> Option<Value>;

    fn put(&self, access_key: &str, key: Value);

    fn delete(&self, access_key: &str) -> Option<Value>;

    /// Keys ordered by access key, skipping `offset` and returning at most
    /// `len`.
    fn list(&self, offset: usize, len: usize) -> Vec<(String, Value)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens the keystore of a space.
pub trait KeyStoreProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the store can't be opened.
    fn open(&self, space: &str) -> anyhow::Result<Arc<dyn KeyStore>>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<BTreeMap<String, Value>>,
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, access_key: &str) -> Option<Value> {
        self.keys.read().get(access_key).cloned()
    }

    fn put(&self, access_key: &str, key: Value) {
        self.keys.write().insert(access_key.to_string(), key);
    }

    fn delete(&self, access_key: &str) -> Option<Value> {
        self.keys.write().remove(access_key)
    }

    fn list(&self, offset: usize, len: usize) -> Vec<(String, Value)> {
        self.keys
            .read()
            .iter()
            .skip(offset)
            .take(len)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.keys.read().len()
    }
}

/// Hands out one [`MemoryKeyStore`] per space for the life of the process.
#[derive(Default)]
pub struct MemoryKeyStoreProvider {
    stores: DashMap<String, Arc<MemoryKeyStore>>,
}

impl KeyStoreProvider for MemoryKeyStoreProvider {
    fn open(&self, space: &str) -> anyhow::Result<Arc<dyn KeyStore>> {
        let store = self.stores.entry(space.to_string()).or_default();
        Ok(Arc::clone(store.value()) as Arc<dyn KeyStore>)
    }
}

/// Copy of `key` without its secret half.
#[must_use]
pub fn strip_secret(key: &Value) -> Value {
    let mut key = key.clone();
    if let Some(obj) = key.as_object_mut() {
        obj.remove(SECRET_FIELD);
    }
    key
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn list_pages_in_key_order() {
        let store = MemoryKeyStore::default();
        for k in ["c", "a", "b"] {
            store.put(k, json!({"accessKey": k}));
        }
        let page: Vec<String> = store.list(1, 5).into_iter().map(|(k, _)| k).collect();
        assert_eq!(page, vec!["b", "c"]);
        assert_eq!(store.delete("a").unwrap()["accessKey"], "a");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn provider_reuses_the_space_store() {
        let provider = MemoryKeyStoreProvider::default();
        provider.open("acme").unwrap().put("k", json!({}));
        assert_eq!(provider.open("acme").unwrap().len(), 1);
        assert!(provider.open("other").unwrap().is_empty());
    }

    #[test]
    fn strip_secret_drops_only_the_secret() {
        let key = json!({"accessKey": "k", "secretKey": "s", "expiry": 1});
        assert_eq!(strip_secret(&key), json!({"accessKey": "k", "expiry": 1}));
    }
}
