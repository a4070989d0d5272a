use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use spaceport_core::{document, Status};
use tokio::sync::oneshot;

use super::{StatusChange, StatusStore};
use crate::config::StatusStoreConfig;
use crate::worker::{BackgroundRunnable, BackgroundWorker};

#[derive(Debug, Default, Clone)]
struct ApiEntry {
    status: Option<Status>,
    services: BTreeMap<String, Status>,
}

struct Inner {
    path: PathBuf,
    read_only: bool,
    entries: Mutex<BTreeMap<String, ApiEntry>>,
    dirty: AtomicBool,
}

impl Inner {
    /// Writes the whole map if something changed since the last write.
    /// Returns whether a write happened.
    async fn flush(&self) -> anyhow::Result<bool> {
        if self.read_only || !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        // Copy under the lock, write outside it.
        let snapshot = self.snapshot();
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || document::store(&path, &snapshot)).await;
        match written {
            Ok(Ok(())) => {
                tracing::debug!(path = %self.path.display(), "status flushed");
                Ok(true)
            }
            Ok(Err(e)) => {
                self.dirty.store(true, Ordering::Release);
                Err(e.into())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(anyhow::anyhow!("status flush task failed: {e}"))
            }
        }
    }

    fn snapshot(&self) -> Value {
        let entries = self.entries.lock();
        let mut root = Map::new();
        for (api, entry) in entries.iter() {
            let mut obj = Map::new();
            if let Some(status) = entry.status {
                obj.insert("status".into(), Value::String(status.to_string()));
            }
            let services: Map<String, Value> = entry
                .services
                .iter()
                .map(|(key, status)| (key.clone(), Value::String(status.to_string())))
                .collect();
            obj.insert("services".into(), Value::Object(services));
            root.insert(api.clone(), Value::Object(obj));
        }
        Value::Object(root)
    }
}

fn parse_status(value: Option<&Value>) -> Option<Status> {
    value.and_then(Value::as_str).and_then(|s| s.parse().ok())
}

/// Reads a status file. Unknown status strings are skipped.
fn read_entries(path: &Path) -> anyhow::Result<BTreeMap<String, ApiEntry>> {
    let doc = document::load(path)?;
    let mut entries = BTreeMap::new();
    let Some(apis) = doc.as_object() else {
        return Ok(entries);
    };
    for (api, value) in apis {
        let mut entry = ApiEntry {
            status: parse_status(value.get("status")),
            services: BTreeMap::new(),
        };
        if let Some(services) = value.get("services").and_then(Value::as_object) {
            for (key, status) in services {
                if let Some(status) = parse_status(Some(status)) {
                    entry.services.insert(key.clone(), status);
                }
            }
        }
        entries.insert(api.clone(), entry);
    }
    Ok(entries)
}

struct Flusher {
    inner: Arc<Inner>,
}

#[async_trait]
impl BackgroundRunnable for Flusher {
    type Job = oneshot::Sender<anyhow::Result<()>>;

    async fn run(&mut self, ack: Self::Job) {
        let _ = ack.send(self.inner.flush().await.map(|_| ()));
    }

    async fn on_tick(&mut self) {
        if let Err(e) = self.inner.flush().await {
            tracing::error!(path = %self.inner.path.display(), error = %e, "status flush failed, retrying next tick");
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.inner.flush().await {
            tracing::error!(path = %self.inner.path.display(), error = %e, "final status flush failed");
        }
    }
}

// ---------------------------------------------------------------------------
// FileStatusStore
// ---------------------------------------------------------------------------

/// Status store backed by one JSON file per space:
///
/// ```json
/// { "billing": { "status": "Running", "services": { "GET/users/:id": "Paused" } } }
/// ```
///
/// A background worker writes the file every `flush_interval` when the
/// in-memory map is dirty. Failed writes keep the map dirty and are retried
/// on the next tick. `shutdown` performs a final flush.
pub struct FileStatusStore {
    inner: Arc<Inner>,
    worker: tokio::sync::Mutex<Option<BackgroundWorker<Flusher>>>,
}

impl FileStatusStore {
    /// Loads the file (if any) and starts the flush worker. Must be called
    /// inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file can't be read or parsed.
    pub fn open(path: impl Into<PathBuf>, config: &StatusStoreConfig) -> anyhow::Result<Self> {
        let path = path.into();
        let exists = path.exists();
        let entries = if exists {
            read_entries(&path)?
        } else {
            BTreeMap::new()
        };
        let inner = Arc::new(Inner {
            path,
            read_only: config.read_only,
            entries: Mutex::new(entries),
            // A missing file is created by the first flush.
            dirty: AtomicBool::new(!exists),
        });
        let worker = BackgroundWorker::spawn(
            format!("status-flush:{}", inner.path.display()),
            Flusher {
                inner: Arc::clone(&inner),
            },
            config.flush_interval,
        );
        Ok(Self {
            inner,
            worker: tokio::sync::Mutex::new(Some(worker)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    fn get(&self, api: &str) -> Option<Status> {
        self.inner.entries.lock().get(api).and_then(|e| e.status)
    }

    fn get_service(&self, api: &str, key: &str) -> Option<Status> {
        self.inner
            .entries
            .lock()
            .get(api)
            .and_then(|e| e.services.get(key).copied())
    }

    fn apply(&self, api: &str, key: Option<&str>, change: StatusChange) {
        {
            let mut entries = self.inner.entries.lock();
            match (key, change) {
                (None, StatusChange::Set(status)) => {
                    entries.entry(api.to_string()).or_default().status = Some(status);
                }
                (None, StatusChange::Delete) => {
                    entries.remove(api);
                }
                (Some(key), StatusChange::Set(status)) => {
                    entries
                        .entry(api.to_string())
                        .or_default()
                        .services
                        .insert(key.to_string(), status);
                }
                (Some(key), StatusChange::Delete) => {
                    if let Some(entry) = entries.get_mut(api) {
                        entry.services.remove(key);
                    }
                }
            }
        }
        self.inner.dirty.store(true, Ordering::Release);
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let worker = self.worker.lock().await;
        if let Some(worker) = worker.as_ref() {
            let (tx, rx) = oneshot::channel();
            worker.submit(tx).await?;
            return rx
                .await
                .map_err(|_| anyhow::anyhow!("status flush worker dropped the request"))?;
        }
        drop(worker);
        self.inner.flush().await.map(|_| ())
    }

    async fn shutdown(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(flush_interval: Duration) -> StatusStoreConfig {
        StatusStoreConfig {
            flush_interval,
            ..StatusStoreConfig::default()
        }
    }

    fn slow() -> StatusStoreConfig {
        config(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn flushed_status_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let store = FileStatusStore::open(&path, &slow()).unwrap();
        store.update("billing", Status::Running);
        store.update_service("billing", "GET/users/:id", Status::Paused);
        store.flush().await.unwrap();
        assert!(!store.is_dirty());

        // Simulated crash: the first store is never shut down.
        let reopened = FileStatusStore::open(&path, &slow()).unwrap();
        assert_eq!(reopened.get("billing"), Some(Status::Running));
        assert_eq!(
            reopened.get_service("billing", "GET/users/:id"),
            Some(Status::Paused)
        );
        reopened.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let store = FileStatusStore::open(&path, &slow()).unwrap();
        store.update("billing", Status::Paused);
        store.shutdown().await;

        let doc = document::load(&path).unwrap();
        assert_eq!(doc["billing"]["status"], "Paused");
    }

    #[tokio::test]
    async fn periodic_flush_writes_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let store = FileStatusStore::open(&path, &config(Duration::from_millis(30))).unwrap();
        store.update("orders", Status::Running);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.is_dirty());
        assert_eq!(document::load(&path).unwrap()["orders"]["status"], "Running");

        // Remove the file behind the store's back: a clean store won't rewrite it.
        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!path.exists());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn delete_removes_entries_instead_of_writing_a_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let store = FileStatusStore::open(&path, &slow()).unwrap();
        store.update("a", Status::Running);
        store.update_service("a", "GET/x", Status::Running);
        store.update_service("a", "POST/y", Status::Stopped);
        store.delete_service("a", "GET/x");
        assert_eq!(store.get_service("a", "GET/x"), None);
        assert_eq!(store.get_service("a", "POST/y"), Some(Status::Stopped));

        store.delete("a");
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get_service("a", "POST/y"), None);

        store.shutdown().await;
        let doc = document::load(&path).unwrap();
        assert!(doc.get("a").is_none());
    }

    #[tokio::test]
    async fn unknown_status_strings_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(
            &path,
            br#"{"a": {"status": "Sleeping", "services": {"GET/x": "Running", "GET/y": 3}}}"#,
        )
        .unwrap();

        let store = FileStatusStore::open(&path, &slow()).unwrap();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get_service("a", "GET/x"), Some(Status::Running));
        assert_eq!(store.get_service("a", "GET/y"), None);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn read_only_store_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let config = StatusStoreConfig {
            read_only: true,
            ..slow()
        };

        let store = FileStatusStore::open(&path, &config).unwrap();
        store.update("a", Status::Running);
        store.flush().await.unwrap();
        store.shutdown().await;

        assert_eq!(store.get("a"), Some(Status::Running));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_write_stays_dirty_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("space");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("status.json");

        let store = FileStatusStore::open(&path, &slow()).unwrap();
        store.update("a", Status::Running);
        assert!(store.flush().await.is_err());
        assert!(store.is_dirty());

        std::fs::remove_file(&blocker).unwrap();
        store.flush().await.unwrap();
        assert!(path.exists());
        assert!(!store.is_dirty());
        store.shutdown().await;
    }
}
