use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use spaceport_core::naming::service_id_from_path;
use spaceport_core::pattern::{join_path, split_path};
use spaceport_core::verb::UnknownVerb;
use spaceport_core::{document, ApiRequest, CompiledEndpoint, Failure, Status, Verb};

use crate::api::ApiModule;
use crate::executor::ServiceRef;
use crate::spi::{symbol_id, NoopServiceSpi, ServiceSpi};
use crate::status::service_key;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service descriptor {0} is not an object")]
    NotAnObject(String),
    #[error("service descriptor {0} has no endpoint")]
    MissingEndpoint(String),
    #[error(transparent)]
    Verb(#[from] UnknownVerb),
}

struct ServiceState {
    status: Status,
    failure: Option<Failure>,
}

/// One endpoint of an api, built from its descriptor file.
pub struct Service {
    id: String,
    verb: Verb,
    endpoint: String,
    compiled: Option<CompiledEndpoint>,
    source: String,
    descriptor: Value,
    state: RwLock<ServiceState>,
    spi: RwLock<Option<Arc<dyn ServiceSpi>>>,
}

impl Service {
    /// Builds a service from its descriptor. An endpoint that doesn't compile
    /// yields a `Failed` service rather than an error, so the registry still
    /// lists it.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor isn't an object, has no endpoint or
    /// names an unknown verb.
    pub fn from_descriptor(source: &str, descriptor: Value) -> Result<Self, ServiceError> {
        if !descriptor.is_object() {
            return Err(ServiceError::NotAnObject(source.to_string()));
        }
        let verb = match document::get_str(&descriptor, "verb") {
            Some(verb) => verb.parse()?,
            None => Verb::Get,
        };
        let endpoint = document::get_str(&descriptor, "endpoint")
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| ServiceError::MissingEndpoint(source.to_string()))?
            .to_string();
        let id = document::get_str(&descriptor, "id")
            .map_or_else(|| service_id_from_path(source), str::to_string);

        let (compiled, state) = match CompiledEndpoint::compile(&endpoint) {
            Ok(compiled) => (
                Some(compiled),
                ServiceState {
                    status: Status::Stopped,
                    failure: None,
                },
            ),
            Err(e) => (
                None,
                ServiceState {
                    status: Status::Failed,
                    failure: Some(Failure::from_error(&e)),
                },
            ),
        };

        Ok(Self {
            id,
            verb,
            endpoint,
            compiled,
            source: source.to_string(),
            descriptor,
            state: RwLock::new(state),
            spi: RwLock::new(None),
        })
    }

    /// Placeholder for a descriptor that couldn't be read or parsed. It is
    /// registered under `GET /<source>` so operators can see why it failed.
    #[must_use]
    pub fn failed(source: &str, failure: Failure) -> Self {
        Self {
            id: service_id_from_path(source),
            verb: Verb::Get,
            endpoint: format!("/{}", source.trim_start_matches('/')),
            compiled: None,
            source: source.to_string(),
            descriptor: Value::Object(Map::new()),
            state: RwLock::new(ServiceState {
                status: Status::Failed,
                failure: Some(failure),
            }),
            spi: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        document::get_str(&self.descriptor, "name").unwrap_or(&self.id)
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Endpoint as written in the descriptor.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn compiled(&self) -> Option<&CompiledEndpoint> {
        self.compiled.as_ref()
    }

    /// Descriptor path relative to the api's resources.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn descriptor(&self) -> &Value {
        &self.descriptor
    }

    /// Status store key.
    pub fn key(&self) -> String {
        service_key(self.verb, &self.endpoint)
    }

    /// Key in the registry's exact-match map: the normalized template.
    pub(crate) fn route_key(&self) -> String {
        normalize_endpoint(&self.endpoint)
    }

    pub fn status(&self) -> Status {
        self.state.read().status
    }

    pub fn failure(&self) -> Option<Failure> {
        self.state.read().failure.clone()
    }

    pub fn custom(&self) -> Option<&Value> {
        self.descriptor.get("custom")
    }

    pub fn security(&self) -> Option<&Value> {
        self.descriptor.get("security")
    }

    /// Declarative request spec handed to the validator.
    pub fn spec(&self) -> Option<&Value> {
        self.descriptor.get("spec")
    }

    pub fn markers(&self) -> usize {
        self.descriptor
            .get("markers")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    pub fn spi(&self) -> Option<Arc<dyn ServiceSpi>> {
        self.spi.read().clone()
    }

    pub(crate) fn function_ref(&self) -> ServiceRef {
        ServiceRef {
            function: self.id.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    pub(crate) fn set_status(&self, status: Status) {
        let mut state = self.state.write();
        state.status = status;
        if status != Status::Failed {
            state.failure = None;
        }
    }

    pub(crate) fn fail(&self, failure: Failure) {
        tracing::warn!(service = %self.id, endpoint = %self.endpoint, error = %failure, "service failed");
        let mut state = self.state.write();
        state.status = Status::Failed;
        state.failure = Some(failure);
    }

    /// Binds path parameters of `request` against this service's template.
    pub fn bind(&self, request: &mut ApiRequest) {
        if let Some(compiled) = &self.compiled {
            for (name, value) in compiled.extract(&request.segments) {
                request.set(name, value);
            }
        }
    }

    /// Resolves the SPI, runs its start hook and moves to `Running`, or to
    /// `Paused` when `pause` is set.
    pub(crate) async fn start(&self, module: &ApiModule, pause: bool) -> anyhow::Result<Status> {
        let spi: Arc<dyn ServiceSpi> = match symbol_id(&self.descriptor, "spi") {
            Some(id) => module.service_spi(id, self.descriptor.get("spi").unwrap_or(&Value::Null))?,
            None => Arc::new(NoopServiceSpi),
        };
        spi.on_start(self).await?;
        *self.spi.write() = Some(spi);
        let status = if pause { Status::Paused } else { Status::Running };
        self.set_status(status);
        Ok(status)
    }

    /// Runs the stop hook and moves to `Stopped`. A `Failed` service keeps
    /// its status.
    pub(crate) async fn stop(&self) {
        let spi = self.spi.write().take();
        if self.status() != Status::Failed {
            self.set_status(Status::Stopped);
        }
        if let Some(spi) = spi {
            if let Err(e) = spi.on_stop(self).await {
                tracing::warn!(service = %self.id, error = %e, "service stop hook failed");
            }
        }
    }

    pub fn describe(&self) -> Value {
        let mut out = json!({
            "id": self.id,
            "name": self.name(),
            "verb": self.verb,
            "endpoint": self.endpoint,
            "status": self.status(),
        });
        if let Some(obj) = out.as_object_mut() {
            if let Some(security) = self.security() {
                obj.insert("security".into(), security.clone());
            }
            if let Some(failure) = self.failure() {
                obj.insert("failure".into(), json!(failure));
            }
            let markers = self.markers();
            if markers > 0 {
                obj.insert("markers".into(), json!(markers));
            }
        }
        out
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("verb", &self.verb)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Canonical form of an endpoint used for exact matching.
pub(crate) fn normalize_endpoint(endpoint: &str) -> String {
    match CompiledEndpoint::compile(endpoint) {
        Ok(compiled) => compiled.normalized().to_string(),
        Err(_) => join_path(&split_path(endpoint).collect::<Vec<_>>()),
    }
}
