//! File resources of an api, rooted at `<api home>/resources`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use spaceport_core::naming::is_valid_path_element;

use crate::error::ManagementError;

/// Folder names managed by the runtime. Operators can read under them but
/// not write or delete.
pub const RESERVED: [&str; 4] = ["services", "messages", "keys", "logs"];

pub struct ResourceManager {
    root: PathBuf,
    started: AtomicBool,
}

impl ResourceManager {
    /// Opens the resources folder, creating `services` and `logs` if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the folders can't be created.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("services"))?;
        std::fs::create_dir_all(root.join("logs"))?;
        Ok(Self {
            root,
            started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn services_dir(&self) -> PathBuf {
        self.root.join("services")
    }

    #[must_use]
    pub fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidResource`] for malformed paths.
    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ManagementError> {
        let file = self.resolve(path, false)?;
        match std::fs::read(&file) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidResource`] for malformed or reserved paths.
    pub fn put(&self, path: &str, bytes: &[u8]) -> Result<(), ManagementError> {
        let file = self.resolve(path, true)?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, bytes)?;
        Ok(())
    }

    /// Returns `false` if there was nothing to delete.
    ///
    /// # Errors
    ///
    /// [`ManagementError::InvalidResource`] for malformed or reserved paths.
    pub fn delete(&self, path: &str) -> Result<bool, ManagementError> {
        let file = self.resolve(path, true)?;
        if file.is_dir() {
            std::fs::remove_dir_all(&file)?;
        } else if file.exists() {
            std::fs::remove_file(&file)?;
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    /// Service descriptors as `(source, file)` pairs sorted by source, where
    /// source is the path relative to the resources root
    /// (`services/users/get.json`).
    ///
    /// # Errors
    ///
    /// Returns an error if the folder can't be walked.
    pub fn service_files(&self) -> io::Result<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        collect_json(&self.services_dir(), "services", &mut found)?;
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Message bundles, sorted by file name. Empty when the folder is
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder exists but can't be read.
    pub fn message_files(&self) -> io::Result<Vec<PathBuf>> {
        let dir = self.messages_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        collect_json(&dir, "messages", &mut found)?;
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn resolve(&self, path: &str, writing: bool) -> Result<PathBuf, ManagementError> {
        let invalid = || ManagementError::InvalidResource(path.to_string());
        let elements: Vec<&str> = path.split('/').filter(|e| !e.is_empty()).collect();
        if elements.is_empty() || !elements.iter().all(|e| is_valid_path_element(e)) {
            return Err(invalid());
        }
        if writing && RESERVED.contains(&elements[0]) {
            return Err(invalid());
        }
        Ok(elements.iter().fold(self.root.clone(), |acc, e| acc.join(e)))
    }
}

fn collect_json(dir: &Path, prefix: &str, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let source = format!("{prefix}/{name}");
        if entry.file_type()?.is_dir() {
            collect_json(&path, &source, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push((source, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_managed_folders() {
        let dir = tempfile::tempdir().unwrap();
        let resources = ResourceManager::open(dir.path().join("resources")).unwrap();
        assert!(resources.services_dir().is_dir());
        assert!(resources.logs_dir().is_dir());
        assert!(resources.message_files().unwrap().is_empty());
    }

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let resources = ResourceManager::open(dir.path()).unwrap();
        resources.put("docs/readme.txt", b"hello").unwrap();
        assert_eq!(resources.get("/docs/readme.txt").unwrap().unwrap(), b"hello");
        assert!(resources.delete("docs/readme.txt").unwrap());
        assert!(!resources.delete("docs/readme.txt").unwrap());
        assert!(resources.get("docs/readme.txt").unwrap().is_none());
    }

    #[test]
    fn reserved_and_traversing_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let resources = ResourceManager::open(dir.path()).unwrap();
        for path in ["services/x.json", "logs/a", "../escape", "a/../../b", "", "bad name"] {
            assert!(
                matches!(resources.put(path, b"x"), Err(ManagementError::InvalidResource(_))),
                "{path}"
            );
        }
        assert!(resources.get("services/missing.json").unwrap().is_none());
    }

    #[test]
    fn service_files_walk_nested_folders() {
        let dir = tempfile::tempdir().unwrap();
        let resources = ResourceManager::open(dir.path()).unwrap();
        let services = resources.services_dir();
        std::fs::create_dir_all(services.join("users")).unwrap();
        std::fs::write(services.join("users/get.json"), "{}").unwrap();
        std::fs::write(services.join("health.json"), "{}").unwrap();
        std::fs::write(services.join("notes.txt"), "").unwrap();

        let sources: Vec<String> = resources.service_files().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(sources, vec!["services/health.json", "services/users/get.json"]);
    }
}
