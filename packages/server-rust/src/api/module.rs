//! Symbol and resource resolution scoped to one api.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use spaceport_core::naming::is_valid_path_element;

use crate::plugins::PluginRegistry;
use crate::spi::{ApiSpi, RequestValidator, ServiceSpi, Symbol, SymbolTable, Tracer};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module of api {0} has been released")]
    Released(String),
    #[error("dependency {dependency} of api {api} not found")]
    MissingDependency { api: String, dependency: String },
    #[error("symbol {id} not found for api {api}")]
    SymbolNotFound { api: String, id: String },
    #[error("symbol {id} is a {found}, expected a {expected}")]
    WrongKind {
        id: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("resource {0} not found")]
    ResourceNotFound(String),
    #[error("invalid resource name {0}")]
    InvalidResource(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolution scope of an api. Private symbols registered for the api come
/// first, then the tables of its declared dependencies in order, then the
/// public symbols of the host.
///
/// An api is isolated when it ships a `lib` folder or declares
/// dependencies; `lib` holds the resources only it can load.
pub struct ApiModule {
    api: String,
    lib: Option<PathBuf>,
    dependencies: Vec<(String, Arc<SymbolTable>)>,
    parent: Arc<SymbolTable>,
    released: AtomicBool,
}

impl ApiModule {
    /// Reads the `dependencies` array of `descriptor` and resolves each
    /// name through `plugins`.
    ///
    /// # Errors
    ///
    /// [`ModuleError::MissingDependency`] if a dependency isn't installed.
    pub fn build(
        api: &str,
        home: &Path,
        descriptor: &Value,
        plugins: &dyn PluginRegistry,
        parent: Arc<SymbolTable>,
    ) -> Result<Self, ModuleError> {
        let lib = Some(home.join("lib")).filter(|lib| lib.is_dir());
        let names = descriptor
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| deps.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut dependencies = Vec::with_capacity(names.len());
        for name in names {
            let table = plugins.find(name).ok_or_else(|| ModuleError::MissingDependency {
                api: api.to_string(),
                dependency: name.to_string(),
            })?;
            dependencies.push((name.to_string(), table));
        }

        tracing::debug!(api, isolated = lib.is_some() || !dependencies.is_empty(), "module built");
        Ok(Self {
            api: api.to_string(),
            lib,
            dependencies,
            parent,
            released: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.lib.is_some() || !self.dependencies.is_empty()
    }

    #[must_use]
    pub fn dependencies(&self) -> Vec<&str> {
        self.dependencies.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// # Errors
    ///
    /// [`ModuleError::Released`] or [`ModuleError::SymbolNotFound`].
    pub fn resolve_symbol(&self, id: &str) -> Result<Symbol, ModuleError> {
        self.ensure_live()?;
        self.parent
            .resolve_private(&self.api, id)
            .or_else(|| self.dependencies.iter().find_map(|(_, table)| table.resolve(id)))
            .or_else(|| self.parent.resolve(id))
            .cloned()
            .ok_or_else(|| ModuleError::SymbolNotFound {
                api: self.api.clone(),
                id: id.to_string(),
            })
    }

    /// Reads a file shipped in the api's `lib` folder.
    ///
    /// # Errors
    ///
    /// Fails once released, for names that leave `lib`, and for files that
    /// don't exist.
    pub fn load_resource(&self, name: &str) -> Result<Vec<u8>, ModuleError> {
        self.ensure_live()?;
        let elements: Vec<&str> = name.split('/').filter(|e| !e.is_empty()).collect();
        if elements.is_empty() || !elements.iter().all(|e| is_valid_path_element(e)) {
            return Err(ModuleError::InvalidResource(name.to_string()));
        }
        let lib = self
            .lib
            .as_ref()
            .ok_or_else(|| ModuleError::ResourceNotFound(name.to_string()))?;
        let file = elements.iter().fold(lib.clone(), |acc, e| acc.join(e));
        match std::fs::read(&file) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ModuleError::ResourceNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Makes the module unusable. Called when the api stops.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            tracing::debug!(api = %self.api, "module released");
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// # Errors
    ///
    /// Resolution errors, a symbol of another kind, or the factory's error.
    pub fn api_spi(&self, id: &str, spec: &Value) -> anyhow::Result<Arc<dyn ApiSpi>> {
        match self.resolve_symbol(id)? {
            Symbol::ApiSpi(factory) => factory(spec),
            other => Err(wrong_kind(id, "api spi", &other).into()),
        }
    }

    /// # Errors
    ///
    /// Resolution errors, a symbol of another kind, or the factory's error.
    pub fn service_spi(&self, id: &str, spec: &Value) -> anyhow::Result<Arc<dyn ServiceSpi>> {
        match self.resolve_symbol(id)? {
            Symbol::ServiceSpi(factory) => factory(spec),
            other => Err(wrong_kind(id, "service spi", &other).into()),
        }
    }

    /// # Errors
    ///
    /// Resolution errors, a symbol of another kind, or the factory's error.
    pub fn validator(&self, id: &str, spec: &Value) -> anyhow::Result<Arc<dyn RequestValidator>> {
        match self.resolve_symbol(id)? {
            Symbol::Validator(factory) => factory(spec),
            other => Err(wrong_kind(id, "validator", &other).into()),
        }
    }

    /// # Errors
    ///
    /// Resolution errors, a symbol of another kind, or the factory's error.
    pub fn tracer(&self, id: &str, spec: &Value) -> anyhow::Result<Arc<dyn Tracer>> {
        match self.resolve_symbol(id)? {
            Symbol::Tracer(factory) => factory(spec),
            other => Err(wrong_kind(id, "tracer", &other).into()),
        }
    }

    fn ensure_live(&self) -> Result<(), ModuleError> {
        if self.is_released() {
            return Err(ModuleError::Released(self.api.clone()));
        }
        Ok(())
    }
}

fn wrong_kind(id: &str, expected: &'static str, found: &Symbol) -> ModuleError {
    ModuleError::WrongKind {
        id: id.to_string(),
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::plugins::{Plugin, PluginSet};
    use crate::spi::{AcceptAll, NoopApiSpi};

    struct Exporter(Arc<SymbolTable>);

    impl Plugin for Exporter {
        fn name(&self) -> &str {
            "exporter"
        }

        fn symbols(&self) -> Option<Arc<SymbolTable>> {
            Some(Arc::clone(&self.0))
        }
    }

    fn validator_symbol() -> Symbol {
        Symbol::validator(|_| Ok(Arc::new(AcceptAll)))
    }

    fn api_symbol() -> Symbol {
        Symbol::api_spi(|_| Ok(Arc::new(NoopApiSpi)))
    }

    #[test]
    fn private_then_dependency_then_public() {
        let dir = tempfile::tempdir().unwrap();
        let parent = Arc::new(
            SymbolTable::new()
                .with("shared", api_symbol())
                .with("both", api_symbol())
                .with_private("billing", "both", validator_symbol()),
        );
        let exported = Arc::new(SymbolTable::new().with("shared", validator_symbol()));
        let plugins = PluginSet::new().with(Arc::new(Exporter(exported)));

        let module = ApiModule::build(
            "billing",
            dir.path(),
            &json!({"dependencies": ["exporter"]}),
            &plugins,
            parent,
        )
        .unwrap();
        assert!(module.is_isolated());
        assert_eq!(module.dependencies(), vec!["exporter"]);

        assert_eq!(module.resolve_symbol("both").unwrap().kind(), "validator");
        assert_eq!(module.resolve_symbol("shared").unwrap().kind(), "validator");
        assert!(matches!(
            module.resolve_symbol("nope"),
            Err(ModuleError::SymbolNotFound { .. })
        ));
        assert!(module.api_spi("shared", &Value::Null).is_err());
        assert!(module.validator("shared", &Value::Null).is_ok());
    }

    #[test]
    fn missing_dependency_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let result = ApiModule::build(
            "billing",
            dir.path(),
            &json!({"dependencies": ["ghost"]}),
            &PluginSet::new(),
            Arc::default(),
        );
        assert!(matches!(result, Err(ModuleError::MissingDependency { .. })));
    }

    #[test]
    fn resources_are_confined_to_lib_and_released_modules_refuse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib/conf")).unwrap();
        std::fs::write(dir.path().join("lib/conf/app.txt"), "ok").unwrap();
        std::fs::write(dir.path().join("outside.txt"), "no").unwrap();

        let module = ApiModule::build("a", dir.path(), &json!({}), &PluginSet::new(), Arc::default()).unwrap();
        assert!(module.is_isolated());
        assert_eq!(module.load_resource("conf/app.txt").unwrap(), b"ok");
        assert!(matches!(
            module.load_resource("../outside.txt"),
            Err(ModuleError::InvalidResource(_))
        ));
        assert!(matches!(
            module.load_resource("conf/missing.txt"),
            Err(ModuleError::ResourceNotFound(_))
        ));

        module.release();
        assert!(matches!(module.load_resource("conf/app.txt"), Err(ModuleError::Released(_))));
        assert!(matches!(module.resolve_symbol("x"), Err(ModuleError::Released(_))));
    }
}
