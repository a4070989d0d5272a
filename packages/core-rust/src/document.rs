//! Helpers over `serde_json::Value` documents: dotted-path access, deep
//! merge and file load/store.

use std::path::Path;

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads a JSON document from a file.
///
/// # Errors
///
/// Returns [`DocumentError::Io`] if the file can't be read and
/// [`DocumentError::Parse`] if it isn't valid JSON.
pub fn load(path: &Path) -> Result<Value, DocumentError> {
    let bytes = std::fs::read(path).map_err(|source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&bytes, &path.display().to_string())
}

/// Parses a JSON document; `origin` only labels errors.
///
/// # Errors
///
/// Returns [`DocumentError::Parse`] if `bytes` isn't valid JSON.
pub fn parse(bytes: &[u8], origin: &str) -> Result<Value, DocumentError> {
    serde_json::from_slice(bytes).map_err(|source| DocumentError::Parse {
        path: origin.to_string(),
        source,
    })
}

/// Writes a document as pretty JSON, replacing the file atomically.
///
/// # Errors
///
/// Returns [`DocumentError::Io`] on any filesystem failure.
pub fn store(path: &Path, doc: &Value) -> Result<(), DocumentError> {
    let io = |source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(doc).map_err(|source| DocumentError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(io)?;
    std::fs::rename(&tmp, path).map_err(io)
}

/// Finds the value at a dotted path such as `executor.coreSize`.
#[must_use]
pub fn find<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|p| !p.is_empty())
        .try_fold(doc, |current, key| current.as_object()?.get(key))
}

#[must_use]
pub fn get_str<'a>(doc: &'a Value, path: &str) -> Option<&'a str> {
    find(doc, path).and_then(Value::as_str)
}

#[must_use]
pub fn get_object<'a>(doc: &'a Value, path: &str) -> Option<&'a Map<String, Value>> {
    find(doc, path).and_then(Value::as_object)
}

#[must_use]
pub fn get_bool(doc: &Value, path: &str, default: bool) -> bool {
    find(doc, path).and_then(Value::as_bool).unwrap_or(default)
}

/// Sets the value at a dotted path, creating intermediate objects and
/// replacing non-object intermediates.
pub fn set(doc: &mut Value, path: &str, value: Value) {
    let keys: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let Some((last, parents)) = keys.split_last() else {
        *doc = value;
        return;
    };
    let mut current = doc;
    for key in parents {
        current = ensure_object(current)
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert((*last).to_string(), value);
}

/// Removes and returns the value at a dotted path.
pub fn remove(doc: &mut Value, path: &str) -> Option<Value> {
    let keys: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let (last, parents) = keys.split_last()?;
    let mut current = doc;
    for key in parents {
        current = current.as_object_mut()?.get_mut(*key)?;
    }
    current.as_object_mut()?.remove(*last)
}

/// Deep-merges `patch` into `target`. Objects merge key by key; any other
/// value in `patch` replaces the target value.
pub fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
