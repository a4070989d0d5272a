//! Persisted lifecycle status of apis and their services.
//!
//! Status is keyed by api namespace and, for services, by `(api, key)` where
//! the key is the verb followed by the raw endpoint (`GET/users/:id`).
//! Mutations are synchronous in-memory updates; persistence happens in the
//! background.

mod file;

pub use file::FileStatusStore;

use async_trait::async_trait;
use spaceport_core::{Status, Verb};

/// Key under which a service's status is stored.
#[must_use]
pub fn service_key(verb: Verb, endpoint: &str) -> String {
    format!("{verb}{endpoint}")
}

/// A status mutation. `Delete` is the deletion marker that removes an entry
/// instead of writing a status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Set(Status),
    Delete,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    fn get(&self, api: &str) -> Option<Status>;

    fn get_service(&self, api: &str, key: &str) -> Option<Status>;

    /// Applies a change to an api (`key == None`) or to one of its services.
    fn apply(&self, api: &str, key: Option<&str>, change: StatusChange);

    fn update(&self, api: &str, status: Status) {
        self.apply(api, None, StatusChange::Set(status));
    }

    fn update_service(&self, api: &str, key: &str, status: Status) {
        self.apply(api, Some(key), StatusChange::Set(status));
    }

    /// Removes the api entry together with every service entry under it.
    fn delete(&self, api: &str) {
        self.apply(api, None, StatusChange::Delete);
    }

    fn delete_service(&self, api: &str, key: &str) {
        self.apply(api, Some(key), StatusChange::Delete);
    }

    /// Persists pending changes now.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store can't be written.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stops background persistence after a final flush.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_concatenates_verb_and_raw_endpoint() {
        assert_eq!(service_key(Verb::Get, "/users/:id"), "GET/users/:id");
    }
}
