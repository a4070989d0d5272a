//! Extension seams invoked by the runtime: api and service SPIs, request
//! validators and tracers.
//!
//! Descriptors name implementations by identifier (`"spi": "billing.Invoices"`
//! or `"spi": {"type": "billing.Invoices", ...}`). Identifiers resolve
//! through a [`SymbolTable`] built at process start, either as public
//! symbols visible to every api or as private symbols visible to one api
//! only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use spaceport_core::{ApiContext, ApiRequest};

use crate::api::ApiHost;
use crate::services::Service;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Api-level lifecycle hooks.
#[async_trait]
pub trait ApiSpi: Send + Sync {
    async fn on_start(&self, _api: &ApiHost) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _api: &ApiHost) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Service logic plus its lifecycle hooks.
#[async_trait]
pub trait ServiceSpi: Send + Sync {
    async fn on_start(&self, _service: &Service) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _service: &Service) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, request: &ApiRequest, ctx: &ApiContext) -> anyhow::Result<Value>;
}

/// Validates a request against the declarative `spec` section of a service.
pub trait RequestValidator: Send + Sync {
    /// # Errors
    ///
    /// Returns a description of the first violation.
    fn validate(&self, api: &str, spec: &Value, request: &ApiRequest) -> anyhow::Result<()>;

    /// Whether `type_name` refers to a structured (object) type.
    fn is_custom_type(&self, _type_name: &str) -> bool {
        false
    }
}

/// Api-scoped diagnostic sink.
pub trait Tracer: Send + Sync {
    fn on_install(&self, _space: &str, _api: &str) {}

    fn on_shutdown(&self, _space: &str, _api: &str) {}

    fn trace(&self, level: tracing::Level, space: &str, api: &str, message: &str);
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApiSpi;

impl ApiSpi for NoopApiSpi {}

/// Used by services that declare no `spi`; answers every request with
/// `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopServiceSpi;

#[async_trait]
impl ServiceSpi for NoopServiceSpi {
    async fn execute(&self, _request: &ApiRequest, _ctx: &ApiContext) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RequestValidator for AcceptAll {
    fn validate(&self, _api: &str, _spec: &Value, _request: &ApiRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards api traces to `tracing` with `space` and `api` fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_install(&self, space: &str, api: &str) {
        tracing::debug!(space, api, "tracer installed");
    }

    fn on_shutdown(&self, space: &str, api: &str) {
        tracing::debug!(space, api, "tracer shut down");
    }

    fn trace(&self, level: tracing::Level, space: &str, api: &str, message: &str) {
        match level {
            tracing::Level::ERROR => tracing::error!(space, api, "{message}"),
            tracing::Level::WARN => tracing::warn!(space, api, "{message}"),
            tracing::Level::INFO => tracing::info!(space, api, "{message}"),
            tracing::Level::DEBUG => tracing::debug!(space, api, "{message}"),
            tracing::Level::TRACE => tracing::trace!(space, api, "{message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// SymbolTable
// ---------------------------------------------------------------------------

pub type ApiSpiFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn ApiSpi>> + Send + Sync>;
pub type ServiceSpiFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn ServiceSpi>> + Send + Sync>;
pub type ValidatorFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn RequestValidator>> + Send + Sync>;
pub type TracerFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Tracer>> + Send + Sync>;

/// A constructor registered under an identifier. Factories receive the
/// descriptor section that named them.
#[derive(Clone)]
pub enum Symbol {
    ApiSpi(ApiSpiFactory),
    ServiceSpi(ServiceSpiFactory),
    Validator(ValidatorFactory),
    Tracer(TracerFactory),
}

impl Symbol {
    pub fn api_spi<F>(factory: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn ApiSpi>> + Send + Sync + 'static,
    {
        Self::ApiSpi(Arc::new(factory))
    }

    pub fn service_spi<F>(factory: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn ServiceSpi>> + Send + Sync + 'static,
    {
        Self::ServiceSpi(Arc::new(factory))
    }

    pub fn validator<F>(factory: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn RequestValidator>> + Send + Sync + 'static,
    {
        Self::Validator(Arc::new(factory))
    }

    pub fn tracer<F>(factory: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn Tracer>> + Send + Sync + 'static,
    {
        Self::Tracer(Arc::new(factory))
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiSpi(_) => "api spi",
            Self::ServiceSpi(_) => "service spi",
            Self::Validator(_) => "validator",
            Self::Tracer(_) => "tracer",
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.kind())
    }
}

/// Identifier to factory map. Built once, then shared read-only.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    public: HashMap<String, Symbol>,
    private: HashMap<(String, String), Symbol>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a symbol visible to every api.
    #[must_use]
    pub fn with(mut self, id: impl Into<String>, symbol: Symbol) -> Self {
        self.register(id, symbol);
        self
    }

    /// Registers a symbol visible to api `api` only.
    #[must_use]
    pub fn with_private(mut self, api: impl Into<String>, id: impl Into<String>, symbol: Symbol) -> Self {
        self.register_private(api, id, symbol);
        self
    }

    pub fn register(&mut self, id: impl Into<String>, symbol: Symbol) {
        self.public.insert(id.into(), symbol);
    }

    pub fn register_private(&mut self, api: impl Into<String>, id: impl Into<String>, symbol: Symbol) {
        self.private.insert((api.into(), id.into()), symbol);
    }

    #[must_use]
    pub fn resolve(&self, id: &str) -> Option<&Symbol> {
        self.public.get(id)
    }

    #[must_use]
    pub fn resolve_private(&self, api: &str, id: &str) -> Option<&Symbol> {
        self.private.get(&(api.to_string(), id.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.public.len() + self.private.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads the identifier of an extension section, given either as a string
/// or as an object with a `type` field.
#[must_use]
pub fn symbol_id<'a>(descriptor: &'a Value, section: &str) -> Option<&'a str> {
    match descriptor.get(section)? {
        Value::String(id) if !id.is_empty() => Some(id),
        Value::Object(obj) => obj.get("type").and_then(Value::as_str).filter(|id| !id.is_empty()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn symbol_id_accepts_string_or_typed_object() {
        let doc = json!({"spi": "billing.Api", "validator": {"type": "strict"}, "tracer": {}});
        assert_eq!(symbol_id(&doc, "spi"), Some("billing.Api"));
        assert_eq!(symbol_id(&doc, "validator"), Some("strict"));
        assert_eq!(symbol_id(&doc, "tracer"), None);
        assert_eq!(symbol_id(&doc, "missing"), None);
    }

    #[test]
    fn private_symbols_are_scoped_to_their_api() {
        let table = SymbolTable::new()
            .with("shared", Symbol::api_spi(|_| Ok(Arc::new(NoopApiSpi))))
            .with_private("billing", "secret", Symbol::api_spi(|_| Ok(Arc::new(NoopApiSpi))));

        assert!(table.resolve("shared").is_some());
        assert!(table.resolve("secret").is_none());
        assert!(table.resolve_private("billing", "secret").is_some());
        assert!(table.resolve_private("orders", "secret").is_none());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn noop_service_answers_null() {
        let request = ApiRequest::new("s", "a", spaceport_core::Verb::Get, "/x");
        let ctx = ApiContext::new();
        assert_eq!(NoopServiceSpi.execute(&request, &ctx).await.unwrap(), Value::Null);
    }
}
