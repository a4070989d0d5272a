use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use spaceport_core::pattern::join_path;
use spaceport_core::{document, Failure, Status, Verb};

use super::service::{normalize_endpoint, Service};
use crate::api::{ApiModule, ResourceManager};
use crate::error::ManagementError;
use crate::status::StatusStore;

#[derive(Default)]
struct VerbServices {
    /// Normalized endpoint -> service.
    by_route: HashMap<String, Arc<Service>>,
    /// Insertion order of `by_route` keys; wildcard lookup scans in it.
    order: Vec<String>,
}

/// The services of one api, indexed by verb then endpoint.
pub struct ServiceRegistry {
    api: String,
    status: Arc<dyn StatusStore>,
    verbs: RwLock<BTreeMap<Verb, VerbServices>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(api: impl Into<String>, status: Arc<dyn StatusStore>) -> Self {
        Self {
            api: api.into(),
            status,
            verbs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers every `*.json` descriptor under the api's `services`
    /// folder. Returns the number of services registered.
    pub fn load(&self, resources: &ResourceManager) -> usize {
        let files = match resources.service_files() {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(api = %self.api, error = %e, "failed to list service descriptors");
                return 0;
            }
        };
        let count = files.len();
        for (source, path) in files {
            match std::fs::read(&path) {
                Ok(bytes) => {
                    self.put(&source, &bytes);
                }
                Err(e) => {
                    self.insert(Service::failed(&source, Failure::from_error(&e)));
                }
            }
        }
        tracing::debug!(api = %self.api, count, "services loaded");
        count
    }

    /// Parses and registers a descriptor. Unreadable descriptors register a
    /// `Failed` placeholder.
    pub fn put(&self, source: &str, payload: &[u8]) -> Arc<Service> {
        match document::parse(payload, source) {
            Ok(descriptor) => self.put_descriptor(source, descriptor),
            Err(e) => self.insert(Service::failed(source, Failure::from_error(&e))),
        }
    }

    pub fn put_descriptor(&self, source: &str, descriptor: Value) -> Arc<Service> {
        let service = Service::from_descriptor(source, descriptor)
            .unwrap_or_else(|e| Service::failed(source, Failure::from_error(&e)));
        self.insert(service)
    }

    /// Registers `service`, replacing any entry with the same verb and
    /// normalized endpoint. The replaced entry's in-memory status is dropped.
    fn insert(&self, service: Service) -> Arc<Service> {
        let service = Arc::new(service);
        if let Some(failure) = service.failure() {
            tracing::warn!(
                api = %self.api,
                source = %service.source(),
                error = %failure,
                "service registered as failed"
            );
        }
        let route = service.route_key();
        let mut verbs = self.verbs.write();
        let set = verbs.entry(service.verb()).or_default();
        if set.by_route.insert(route.clone(), Arc::clone(&service)).is_some() {
            tracing::debug!(api = %self.api, verb = %service.verb(), endpoint = %route, "service replaced");
            set.order.retain(|r| r != &route);
        }
        set.order.push(route);
        service
    }

    #[must_use]
    pub fn get(&self, verb: Verb, endpoint: &str) -> Option<Arc<Service>> {
        let route = normalize_endpoint(endpoint);
        self.verbs.read().get(&verb)?.by_route.get(&route).cloned()
    }

    #[must_use]
    pub fn get_by_id(&self, id: &str) -> Option<Arc<Service>> {
        let verbs = self.verbs.read();
        verbs
            .values()
            .flat_map(|set| set.by_route.values())
            .find(|s| s.id() == id)
            .cloned()
    }

    #[must_use]
    pub fn exists(&self, verb: Verb, endpoint: &str) -> bool {
        self.get(verb, endpoint).is_some()
    }

    /// Routes a request path. An exact template match wins; otherwise the
    /// first wildcard template, in registration order, that matches.
    #[must_use]
    pub fn lookup<S: AsRef<str>>(&self, verb: Verb, segments: &[S]) -> Option<Arc<Service>> {
        let verbs = self.verbs.read();
        let set = verbs.get(&verb)?;
        if let Some(exact) = set.by_route.get(&join_path(segments)) {
            return Some(Arc::clone(exact));
        }
        set.order
            .iter()
            .filter_map(|route| set.by_route.get(route))
            .find(|s| {
                s.compiled()
                    .is_some_and(|c| c.is_wildcard() && c.matches_segments(segments))
            })
            .cloned()
    }

    /// Removes a `Stopped` or `Failed` service and its persisted status.
    ///
    /// # Errors
    ///
    /// [`ManagementError::ServiceNotFound`] or
    /// [`ManagementError::InvalidState`] if the service is still active.
    pub fn delete(&self, verb: Verb, endpoint: &str) -> Result<Arc<Service>, ManagementError> {
        let service = self.require(verb, endpoint)?;
        let status = service.status();
        if status.is_active() {
            return Err(ManagementError::invalid_state(
                "delete",
                subject(&service),
                status,
                "Stopped or Failed",
            ));
        }
        let route = service.route_key();
        {
            let mut verbs = self.verbs.write();
            if let Some(set) = verbs.get_mut(&verb) {
                set.by_route.remove(&route);
                set.order.retain(|r| r != &route);
                if set.by_route.is_empty() {
                    verbs.remove(&verb);
                }
            }
        }
        self.status.delete_service(&self.api, &service.key());
        Ok(service)
    }

    /// Whether the registry holds no service for `verb`, or none at all.
    #[must_use]
    pub fn is_empty(&self, verb: Option<Verb>) -> bool {
        let verbs = self.verbs.read();
        let verbs_to_check: &[Verb] = match &verb {
            Some(v) => std::slice::from_ref(v),
            None => &Verb::ALL,
        };
        verbs_to_check
            .iter()
            .all(|v| verbs.get(v).map_or(true, |set| set.by_route.is_empty()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.verbs.read().values().map(|set| set.by_route.len()).sum()
    }

    /// Visits services in verb then registration order until `selector`
    /// returns `true`.
    pub fn list(&self, mut selector: impl FnMut(&Arc<Service>) -> bool) {
        for service in self.services() {
            if selector(&service) {
                break;
            }
        }
    }

    /// Snapshot of every service, in verb then registration order.
    #[must_use]
    pub fn services(&self) -> Vec<Arc<Service>> {
        let verbs = self.verbs.read();
        verbs
            .values()
            .flat_map(|set| set.order.iter().filter_map(|r| set.by_route.get(r)))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.verbs.write().clear();
    }

    // -- lifecycle -----------------------------------------------------------

    /// Starts services as part of an api start. Each service resumes the
    /// persisted status it had: `Stopped` and `Failed` stay down, `Paused`
    /// starts paused, anything else starts. Faults mark the service `Failed`
    /// without failing the api.
    pub async fn start_all(&self, module: &ApiModule) {
        for service in self.services() {
            if service.status() == Status::Failed {
                continue;
            }
            let pause = match self.status.get_service(&self.api, &service.key()) {
                Some(Status::Stopped | Status::Failed) => continue,
                Some(Status::Paused) => true,
                Some(Status::Running) | None => false,
            };
            match service.start(module, pause).await {
                Ok(status) => self.status.update_service(&self.api, &service.key(), status),
                Err(e) => service.fail(Failure::from_anyhow(&e)),
            }
        }
    }

    /// Stops every active service as part of an api stop. Persisted status
    /// is left as is so the next start resumes it.
    pub async fn stop_all(&self) {
        for service in self.services() {
            if service.status().is_active() {
                service.stop().await;
            }
        }
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] on a `Failed` service and
    /// [`ManagementError::StartFailed`] if its start hook fails.
    pub async fn start(&self, verb: Verb, endpoint: &str, module: &ApiModule) -> Result<(), ManagementError> {
        let service = self.require(verb, endpoint)?;
        match service.status() {
            Status::Running => Ok(()),
            Status::Failed => Err(ManagementError::invalid_state(
                "start",
                subject(&service),
                Status::Failed,
                "Stopped or Paused",
            )),
            Status::Paused => {
                service.set_status(Status::Running);
                self.status.update_service(&self.api, &service.key(), Status::Running);
                Ok(())
            }
            Status::Stopped => match service.start(module, false).await {
                Ok(status) => {
                    self.status.update_service(&self.api, &service.key(), status);
                    Ok(())
                }
                Err(source) => {
                    service.fail(Failure::from_anyhow(&source));
                    Err(ManagementError::StartFailed {
                        subject: subject(&service),
                        source,
                    })
                }
            },
        }
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] unless the service is `Running`.
    pub async fn stop(&self, verb: Verb, endpoint: &str) -> Result<(), ManagementError> {
        let service = self.require_status(verb, endpoint, "stop", Status::Running)?;
        service.stop().await;
        self.status.update_service(&self.api, &service.key(), Status::Stopped);
        Ok(())
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] unless the service is `Running`.
    pub fn pause(&self, verb: Verb, endpoint: &str) -> Result<(), ManagementError> {
        let service = self.require_status(verb, endpoint, "pause", Status::Running)?;
        service.set_status(Status::Paused);
        self.status.update_service(&self.api, &service.key(), Status::Paused);
        Ok(())
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] unless the service is `Paused`.
    pub fn resume(&self, verb: Verb, endpoint: &str) -> Result<(), ManagementError> {
        let service = self.require_status(verb, endpoint, "resume", Status::Paused)?;
        service.set_status(Status::Running);
        self.status.update_service(&self.api, &service.key(), Status::Running);
        Ok(())
    }

    fn require(&self, verb: Verb, endpoint: &str) -> Result<Arc<Service>, ManagementError> {
        self.get(verb, endpoint).ok_or_else(|| ManagementError::ServiceNotFound {
            api: self.api.clone(),
            verb,
            endpoint: endpoint.to_string(),
        })
    }

    fn require_status(
        &self,
        verb: Verb,
        endpoint: &str,
        action: &'static str,
        expected: Status,
    ) -> Result<Arc<Service>, ManagementError> {
        let service = self.require(verb, endpoint)?;
        let current = service.status();
        if current != expected {
            return Err(ManagementError::invalid_state(
                action,
                subject(&service),
                current,
                expected.as_str(),
            ));
        }
        Ok(service)
    }
}

fn subject(service: &Service) -> String {
    format!("service {} {}", service.verb(), service.endpoint())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::status::FileStatusStore;

    fn store() -> (tempfile::TempDir, Arc<dyn StatusStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::open(
            dir.path().join("status.json"),
            &crate::config::StatusStoreConfig {
                read_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        (dir, Arc::new(store))
    }

    fn put(registry: &ServiceRegistry, verb: &str, endpoint: &str) -> Arc<Service> {
        registry.put_descriptor(
            &format!("services/{}.json", endpoint.replace('/', "_")),
            json!({"verb": verb, "endpoint": endpoint}),
        )
    }

    #[tokio::test]
    async fn exact_match_beats_wildcard() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", status);
        let wildcard = put(&registry, "GET", "/users/:id");
        let exact = put(&registry, "GET", "/users/me");

        let found = registry.lookup(Verb::Get, &["users", "me"]).unwrap();
        assert!(Arc::ptr_eq(&found, &exact));
        let found = registry.lookup(Verb::Get, &["users", "42"]).unwrap();
        assert!(Arc::ptr_eq(&found, &wildcard));
        assert!(registry.lookup(Verb::Post, &["users", "42"]).is_none());
        assert!(registry.lookup(Verb::Get, &["users"]).is_none());
    }

    #[tokio::test]
    async fn wildcards_match_in_registration_order() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", status);
        let first = put(&registry, "GET", "/files/::path");
        put(&registry, "GET", "/files/:name");

        let found = registry.lookup(Verb::Get, &["files", "a"]).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
    }

    #[tokio::test]
    async fn put_replaces_same_verb_and_template() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", status);
        put(&registry, "GET", "/users/:id");
        let replacement = put(&registry, "GET", "/users/:uid");

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(Verb::Get, "/users/*").unwrap(), &replacement));
        assert!(registry.exists(Verb::Get, "/users/:anything"));
    }

    #[tokio::test]
    async fn unparseable_descriptor_registers_failed_placeholder() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", status);
        let service = registry.put("services/broken.json", b"{ not json");
        assert_eq!(service.status(), Status::Failed);
        assert_eq!(service.endpoint(), "/services/broken.json");
        assert!(registry.get_by_id("Broken").is_some());
    }

    #[tokio::test]
    async fn is_empty_per_verb_and_overall() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", status);
        assert!(registry.is_empty(None));
        put(&registry, "OPTIONS", "/x");
        assert!(!registry.is_empty(None));
        assert!(!registry.is_empty(Some(Verb::Options)));
        assert!(registry.is_empty(Some(Verb::Get)));
    }

    #[tokio::test]
    async fn list_stops_when_selector_says_so() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", status);
        put(&registry, "GET", "/a");
        put(&registry, "GET", "/b");
        put(&registry, "POST", "/c");

        let mut seen = Vec::new();
        registry.list(|s| {
            seen.push(s.endpoint().to_string());
            seen.len() == 2
        });
        assert_eq!(seen, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn delete_requires_inactive_service() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", Arc::clone(&status));
        let service = put(&registry, "GET", "/x");
        service.set_status(Status::Running);
        status.update_service("api", &service.key(), Status::Running);

        let err = registry.delete(Verb::Get, "/x").unwrap_err();
        assert!(matches!(err, ManagementError::InvalidState { current: Status::Running, .. }));

        service.set_status(Status::Stopped);
        registry.delete(Verb::Get, "/x").unwrap();
        assert!(registry.is_empty(None));
        assert_eq!(status.get_service("api", "GET/x"), None);
        assert!(matches!(
            registry.delete(Verb::Get, "/x"),
            Err(ManagementError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn pause_and_resume_check_preconditions() {
        let (_dir, status) = store();
        let registry = ServiceRegistry::new("api", Arc::clone(&status));
        let service = put(&registry, "GET", "/x");

        let err = registry.resume(Verb::Get, "/x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't resume service GET /x. Status=Stopped, expected Paused"
        );

        service.set_status(Status::Running);
        registry.pause(Verb::Get, "/x").unwrap();
        assert_eq!(service.status(), Status::Paused);
        assert_eq!(status.get_service("api", "GET/x"), Some(Status::Paused));
        registry.resume(Verb::Get, "/x").unwrap();
        assert_eq!(status.get_service("api", "GET/x"), Some(Status::Running));
    }
}
