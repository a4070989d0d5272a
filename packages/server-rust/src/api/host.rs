use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use spaceport_core::naming::is_valid_namespace;
use spaceport_core::{document, ApiRequest, DocumentError, Failure, Status};

use super::i18n::{format_message, Messages};
use super::{ApiEnv, ApiModule, ResourceManager};
use crate::describe::{DescribeOption, DescribeOptions};
use crate::error::ManagementError;
use crate::plugins::{Event, Subject};
use crate::services::{group, GroupingFlow, Service, ServiceRegistry};
use crate::spi::{symbol_id, ApiSpi, NoopApiSpi, RequestValidator, Tracer};

pub const DESCRIPTOR_FILE: &str = "api.json";

struct ApiState {
    status: Status,
    failure: Option<Failure>,
}

/// What exists only while the api is started.
#[derive(Clone)]
struct Started {
    module: Arc<ApiModule>,
    spi: Arc<dyn ApiSpi>,
    validator: Arc<dyn RequestValidator>,
    tracer: Arc<dyn Tracer>,
}

/// One installed api.
///
/// Loading never fails: problems with the descriptor, the namespace or the
/// resources leave the api registered as `Failed` with a [`Failure`] that
/// `describe` reports.
pub struct ApiHost {
    env: ApiEnv,
    home: PathBuf,
    namespace: String,
    descriptor: Value,
    state: RwLock<ApiState>,
    resources: Option<ResourceManager>,
    services: ServiceRegistry,
    started: RwLock<Option<Started>>,
    messages: RwLock<Messages>,
}

impl ApiHost {
    pub fn load(env: ApiEnv, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let (descriptor, failure) = match read_descriptor(&home) {
            Ok(descriptor) => (descriptor, None),
            Err(e) => (Value::Object(Map::new()), Some(Failure::from_error(&e))),
        };
        let namespace = document::get_str(&descriptor, "namespace")
            .map_or_else(|| folder_name(&home), str::to_string);
        let services = ServiceRegistry::new(namespace.clone(), Arc::clone(&env.status));

        let mut host = Self {
            env,
            home,
            namespace,
            descriptor,
            state: RwLock::new(ApiState {
                status: Status::Stopped,
                failure: None,
            }),
            resources: None,
            services,
            started: RwLock::new(None),
            messages: RwLock::new(Messages::default()),
        };

        if let Some(failure) = failure {
            host.fail(failure);
            return host;
        }
        if !is_valid_namespace(&host.namespace) {
            let failure = Failure::new(format!("invalid api namespace {}", host.namespace));
            host.fail(failure);
            return host;
        }
        match ResourceManager::open(host.home.join("resources")) {
            Ok(resources) => {
                host.services.load(&resources);
                host.resources = Some(resources);
            }
            Err(e) => host.fail(Failure::from_error(&e)),
        }
        tracing::debug!(
            space = %host.env.space,
            api = %host.namespace,
            services = host.services.len(),
            "api loaded"
        );
        host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn space(&self) -> &str {
        &self.env.space
    }

    pub fn name(&self) -> &str {
        document::get_str(&self.descriptor, "name").unwrap_or(&self.namespace)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn descriptor(&self) -> &Value {
        &self.descriptor
    }

    pub fn status(&self) -> Status {
        self.state.read().status
    }

    pub fn failure(&self) -> Option<Failure> {
        self.state.read().failure.clone()
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn resources(&self) -> Option<&ResourceManager> {
        self.resources.as_ref()
    }

    /// The module, while the api is started.
    pub fn module(&self) -> Option<Arc<ApiModule>> {
        self.started.read().as_ref().map(|s| Arc::clone(&s.module))
    }

    pub fn validator(&self) -> Arc<dyn RequestValidator> {
        self.started
            .read()
            .as_ref()
            .map_or_else(|| Arc::clone(&self.env.validator), |s| Arc::clone(&s.validator))
    }

    pub fn tracer(&self) -> Arc<dyn Tracer> {
        self.started
            .read()
            .as_ref()
            .map_or_else(|| Arc::clone(&self.env.tracer), |s| Arc::clone(&s.tracer))
    }

    /// Language of the api's messages, `language` in the descriptor.
    pub fn language(&self) -> &str {
        document::get_str(&self.descriptor, "language").unwrap_or(&self.env.default_language)
    }

    pub(crate) fn fail(&self, failure: Failure) {
        tracing::error!(space = %self.env.space, api = %self.namespace, error = %failure, "api failed");
        let mut state = self.state.write();
        state.status = Status::Failed;
        state.failure = Some(failure);
    }

    pub(crate) fn set_status(&self, status: Status, persist: bool) {
        {
            let mut state = self.state.write();
            state.status = status;
            if status != Status::Failed {
                state.failure = None;
            }
        }
        if persist {
            self.env.status.update(&self.namespace, status);
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Starts the api and its services, `Paused` when `pause` is set.
    /// Returns the resulting status; faults land the api in `Failed`.
    pub async fn start(&self, pause: bool) -> Status {
        if self.status() == Status::Failed {
            return Status::Failed;
        }
        if let Err(e) = self.try_start(pause).await {
            self.fail(Failure::from_anyhow(&e));
            self.release();
            return Status::Failed;
        }
        let status = if pause { Status::Paused } else { Status::Running };
        self.set_status(status, true);
        tracing::info!(space = %self.env.space, api = %self.namespace, status = %status, "api started");
        status
    }

    async fn try_start(&self, pause: bool) -> anyhow::Result<()> {
        let module = Arc::new(ApiModule::build(
            &self.namespace,
            &self.home,
            &self.descriptor,
            self.env.plugins.as_ref(),
            Arc::clone(&self.env.symbols),
        )?);

        let mut messages = Messages::default();
        if let Some(resources) = &self.resources {
            resources.start();
            messages = Messages::load(&resources.message_files()?)?;
        }
        *self.messages.write() = messages;

        let spi: Arc<dyn ApiSpi> = match symbol_id(&self.descriptor, "spi") {
            Some(id) => module.api_spi(id, section(&self.descriptor, "spi"))?,
            None => Arc::new(NoopApiSpi),
        };
        let validator = match symbol_id(&self.descriptor, "validator") {
            Some(id) => module.validator(id, section(&self.descriptor, "validator"))?,
            None => Arc::clone(&self.env.validator),
        };
        let tracer = match symbol_id(&self.descriptor, "tracer") {
            Some(id) => module.tracer(id, section(&self.descriptor, "tracer"))?,
            None => Arc::clone(&self.env.tracer),
        };
        tracer.on_install(&self.env.space, &self.namespace);

        *self.started.write() = Some(Started {
            module: Arc::clone(&module),
            spi: Arc::clone(&spi),
            validator,
            tracer,
        });

        self.env
            .plugins
            .on_event(Event::Start, &Subject::Api(self))
            .await?;
        if let Err(e) = spi.on_start(self).await {
            if let Err(stop) = self.env.plugins.on_event(Event::Stop, &Subject::Api(self)).await {
                tracing::warn!(space = %self.env.space, api = %self.namespace, error = %stop, "plugin stop failed");
            }
            return Err(e.context("api start hook failed"));
        }
        if pause {
            tracing::debug!(api = %self.namespace, "starting paused");
        }
        self.services.start_all(&module).await;
        Ok(())
    }

    /// Stops services and hooks and releases the module. Faults in hooks are
    /// logged; the api still stops. A `Failed` api keeps its status.
    pub async fn stop(&self, persist: bool) {
        if let Err(e) = self.env.plugins.on_event(Event::Stop, &Subject::Api(self)).await {
            tracing::warn!(space = %self.env.space, api = %self.namespace, error = %e, "plugin stop failed");
        }
        self.services.stop_all().await;

        let started = self.started.read().clone();
        if let Some(started) = started {
            if let Err(e) = started.spi.on_stop(self).await {
                tracing::warn!(space = %self.env.space, api = %self.namespace, error = %e, "api stop hook failed");
            }
            started.tracer.on_shutdown(&self.env.space, &self.namespace);
        }
        if let Some(resources) = &self.resources {
            resources.stop();
        }
        self.release();

        if self.status() != Status::Failed {
            self.set_status(Status::Stopped, persist);
        }
        tracing::info!(space = %self.env.space, api = %self.namespace, "api stopped");
    }

    pub(crate) fn pause(&self) {
        self.set_status(Status::Paused, true);
    }

    pub(crate) fn resume(&self) {
        self.set_status(Status::Running, true);
    }

    /// Drops the messages and the module.
    pub(crate) fn release(&self) {
        self.messages.write().clear();
        if let Some(started) = self.started.write().take() {
            started.module.release();
        }
    }

    /// Unregisters every service.
    pub fn clear(&self) {
        self.services.clear();
    }

    // -- requests ------------------------------------------------------------

    /// Finds the service for `request` and binds its path parameters.
    pub fn lookup(&self, request: &mut ApiRequest) -> Option<Arc<Service>> {
        let service = self.services.lookup(request.verb, &request.segments)?;
        service.bind(request);
        Some(service)
    }

    /// Checks `request` against the service's `spec` section, if any.
    ///
    /// # Errors
    ///
    /// [`ManagementError::Validation`] with the validator's reason.
    pub fn validate(&self, service: &Service, request: &ApiRequest) -> Result<(), ManagementError> {
        let Some(spec) = service.spec() else {
            return Ok(());
        };
        self.validator()
            .validate(&self.namespace, spec, request)
            .map_err(ManagementError::Validation)
    }

    /// Localized message for `key`, falling back to the api language and
    /// then the runtime default. Unknown keys return the key itself.
    pub fn message(&self, lang: Option<&str>, key: &str, args: &[&str]) -> String {
        let messages = self.messages.read();
        let template = lang
            .and_then(|lang| messages.get(lang, key))
            .or_else(|| messages.get(self.language(), key))
            .or_else(|| messages.get(&self.env.default_language, key));
        match template {
            Some(template) => format_message(template, args),
            None => key.to_string(),
        }
    }

    pub fn trace(&self, level: tracing::Level, message: &str) {
        self.tracer().trace(level, &self.env.space, &self.namespace, message);
    }

    pub fn group_services(&self, property: &str, item_key: Option<&str>, flow: &dyn GroupingFlow) -> Value {
        let validator = self.validator();
        let is_object_type = |service: &Service| {
            document::get_str(service.descriptor(), "spec.type")
                .is_some_and(|t| validator.is_custom_type(t))
        };
        group::group_by(
            &self.namespace,
            &self.services.services(),
            property,
            item_key,
            flow,
            &is_object_type,
        )
    }

    pub fn describe(&self, options: &DescribeOptions) -> Value {
        let mut out = Map::new();
        out.insert("namespace".into(), json!(self.namespace));
        out.insert("name".into(), json!(self.name()));
        out.insert("status".into(), json!(self.status()));
        if let Some(failure) = self.failure() {
            out.insert("failure".into(), json!(failure));
        }

        if options.has(DescribeOption::Info) {
            if let Some(description) = self.descriptor.get("description") {
                out.insert("description".into(), description.clone());
            }
            out.insert("home".into(), json!(self.home.display().to_string()));
            out.insert("language".into(), json!(self.language()));
            out.insert(
                "isolated".into(),
                json!(self.module().is_some_and(|m| m.is_isolated())),
            );
        }

        let services = self.services.services();
        if options.has(DescribeOption::Services) {
            let list: Vec<Value> = services.iter().map(|s| s.describe()).collect();
            out.insert("services".into(), Value::Array(list));
        } else {
            out.insert("services".into(), json!(services.len()));
        }
        if options.has(DescribeOption::FailedServices) {
            let failed = services.iter().filter(|s| s.status() == Status::Failed).count();
            out.insert("failed".into(), json!(failed));
        }
        if options.has(DescribeOption::FailedDetails) {
            let details: Map<String, Value> = services
                .iter()
                .filter_map(|s| s.failure().map(|f| (s.key(), json!(f))))
                .collect();
            out.insert("failedDetails".into(), Value::Object(details));
        }
        if options.has(DescribeOption::Markers) {
            let markers: usize = services.iter().map(|s| s.markers()).sum();
            out.insert("markers".into(), json!(markers));
        }

        for (option, key) in [
            (DescribeOption::Security, "security"),
            (DescribeOption::Tracking, "tracking"),
            (DescribeOption::Features, "features"),
            (DescribeOption::Runtime, "runtime"),
        ] {
            if options.has(option) {
                if let Some(section) = self.descriptor.get(key) {
                    out.insert(key.into(), section.clone());
                }
            }
        }
        Value::Object(out)
    }
}

fn read_descriptor(home: &Path) -> Result<Value, DocumentError> {
    let file = home.join(DESCRIPTOR_FILE);
    if !file.exists() {
        return Ok(Value::Object(Map::new()));
    }
    let descriptor = document::load(&file)?;
    if descriptor.is_object() {
        Ok(descriptor)
    } else {
        Err(DocumentError::Io {
            path: file.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "api descriptor must be an object"),
        })
    }
}

fn folder_name(home: &Path) -> String {
    home.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn section<'a>(descriptor: &'a Value, key: &str) -> &'a Value {
    descriptor.get(key).unwrap_or(&Value::Null)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use spaceport_core::{ApiContext, Verb};

    use super::*;
    use crate::api::testing::{env, env_with_symbols, write_api};
    use crate::services::KeepAll;
    use crate::plugins::{Plugin, PluginSet};
    use crate::spi::{ServiceSpi, Symbol, SymbolTable};

    #[derive(Clone, Default)]
    struct Hooks(Arc<Mutex<Vec<String>>>);

    impl Hooks {
        fn calls(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    #[async_trait]
    impl ApiSpi for Hooks {
        async fn on_start(&self, api: &ApiHost) -> anyhow::Result<()> {
            self.0.lock().push(format!("api start {}", api.namespace()));
            Ok(())
        }

        async fn on_stop(&self, api: &ApiHost) -> anyhow::Result<()> {
            self.0.lock().push(format!("api stop {}", api.namespace()));
            Ok(())
        }
    }

    #[async_trait]
    impl ServiceSpi for Hooks {
        async fn on_start(&self, service: &Service) -> anyhow::Result<()> {
            if service.endpoint() == "/broken" {
                anyhow::bail!("cannot start");
            }
            self.0.lock().push(format!("service start {}", service.endpoint()));
            Ok(())
        }

        async fn execute(&self, _request: &ApiRequest, _ctx: &ApiContext) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn symbols(hooks: &Hooks) -> SymbolTable {
        let api = hooks.clone();
        let service = hooks.clone();
        SymbolTable::new()
            .with(
                "hooks",
                Symbol::api_spi(move |_| Ok(Arc::new(api.clone()) as Arc<dyn ApiSpi>)),
            )
            .with(
                "svc",
                Symbol::service_spi(move |_| Ok(Arc::new(service.clone()) as Arc<dyn ServiceSpi>)),
            )
    }

    #[tokio::test]
    async fn missing_descriptor_uses_folder_name() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("orders");
        std::fs::create_dir_all(&home).unwrap();
        let api = ApiHost::load(env(dir.path()), &home);
        assert_eq!(api.namespace(), "orders");
        assert_eq!(api.status(), Status::Stopped);
        assert!(home.join("resources/services").is_dir());
        assert!(home.join("resources/logs").is_dir());
    }

    #[tokio::test]
    async fn invalid_namespace_and_bad_descriptor_fail() {
        let dir = tempfile::tempdir().unwrap();
        let home = write_api(dir.path(), "bad", &json!({"namespace": "no spaces allowed"}), &[]);
        let api = ApiHost::load(env(dir.path()), &home);
        assert_eq!(api.status(), Status::Failed);
        assert!(api.failure().unwrap().message.contains("invalid api namespace"));
        assert_eq!(api.start(false).await, Status::Failed);

        let home = dir.path().join("garbled");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join(DESCRIPTOR_FILE), "{").unwrap();
        let api = ApiHost::load(env(dir.path()), &home);
        assert_eq!(api.status(), Status::Failed);
    }

    #[tokio::test]
    async fn start_and_stop_run_hooks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = Hooks::default();
        let env = env_with_symbols(dir.path(), symbols(&hooks));
        let home = write_api(
            dir.path(),
            "billing",
            &json!({"namespace": "billing", "spi": "hooks"}),
            &[
                ("a.json", json!({"endpoint": "/a", "spi": "svc"})),
                ("broken.json", json!({"endpoint": "/broken", "spi": "svc"})),
            ],
        );
        let status = Arc::clone(&env.status);
        let api = ApiHost::load(env, &home);

        assert_eq!(api.start(false).await, Status::Running);
        assert_eq!(status.get("billing"), Some(Status::Running));
        assert!(api.module().is_some());
        assert_eq!(api.services().get(Verb::Get, "/a").unwrap().status(), Status::Running);
        let broken = api.services().get(Verb::Get, "/broken").unwrap();
        assert_eq!(broken.status(), Status::Failed);
        assert_eq!(status.get_service("billing", "GET/broken"), None);

        api.stop(true).await;
        assert_eq!(api.status(), Status::Stopped);
        assert_eq!(status.get("billing"), Some(Status::Stopped));
        assert!(api.module().is_none());
        assert_eq!(
            hooks.calls(),
            vec!["api start billing", "service start /a", "api stop billing"]
        );
        // Service statuses survive the api stop.
        assert_eq!(status.get_service("billing", "GET/a"), Some(Status::Running));
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_event(&self, event: Event, _subject: &Subject<'_>) -> anyhow::Result<()> {
            self.0.lock().push(event);
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl ApiSpi for Refuse {
        async fn on_start(&self, _api: &ApiHost) -> anyhow::Result<()> {
            anyhow::bail!("not today")
        }
    }

    #[tokio::test]
    async fn failed_start_hook_tells_plugins_to_stop() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut env = env_with_symbols(
            dir.path(),
            SymbolTable::new().with("refuse", Symbol::api_spi(|_| Ok(Arc::new(Refuse) as Arc<dyn ApiSpi>))),
        );
        env.plugins = Arc::new(PluginSet::new().with(Arc::clone(&recorder) as Arc<dyn Plugin>));
        let home = write_api(dir.path(), "grumpy", &json!({"namespace": "grumpy", "spi": "refuse"}), &[]);
        let api = ApiHost::load(env, &home);

        assert_eq!(api.start(false).await, Status::Failed);
        assert!(api.failure().unwrap().message.contains("api start hook failed"));
        assert_eq!(*recorder.0.lock(), vec![Event::Start, Event::Stop]);
        assert!(api.module().is_none());
    }

    #[tokio::test]
    async fn missing_dependency_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let home = write_api(
            dir.path(),
            "deps",
            &json!({"namespace": "deps", "dependencies": ["ghost"]}),
            &[],
        );
        let api = ApiHost::load(env(dir.path()), &home);
        assert_eq!(api.start(false).await, Status::Failed);
        let failure = api.failure().unwrap();
        assert!(failure.message.contains("ghost"));
        assert!(api.module().is_none());
    }

    #[tokio::test]
    async fn persisted_service_status_is_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        env.status.update_service("shop", "GET/paused", Status::Paused);
        env.status.update_service("shop", "GET/off", Status::Stopped);
        let home = write_api(
            dir.path(),
            "shop",
            &json!({"namespace": "shop"}),
            &[
                ("paused.json", json!({"endpoint": "/paused"})),
                ("off.json", json!({"endpoint": "/off"})),
                ("on.json", json!({"endpoint": "/on"})),
            ],
        );
        let api = ApiHost::load(env, &home);
        assert_eq!(api.start(true).await, Status::Paused);

        let services = api.services();
        assert_eq!(services.get(Verb::Get, "/paused").unwrap().status(), Status::Paused);
        assert_eq!(services.get(Verb::Get, "/off").unwrap().status(), Status::Stopped);
        assert_eq!(services.get(Verb::Get, "/on").unwrap().status(), Status::Running);
    }

    #[tokio::test]
    async fn lookup_binds_parameters_and_messages_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let home = write_api(
            dir.path(),
            "users",
            &json!({"namespace": "users", "language": "fr"}),
            &[("posts.json", json!({"endpoint": "/users/:id/posts/::rest"}))],
        );
        let messages = home.join("resources/messages");
        std::fs::create_dir_all(&messages).unwrap();
        std::fs::write(
            messages.join("main.json"),
            r#"{"greet": {"en": "Hello {0}", "fr": "Bonjour {0}"}, "bye": {"en": "Bye"}}"#,
        )
        .unwrap();

        let api = ApiHost::load(env(dir.path()), &home);
        api.start(false).await;

        let mut request = ApiRequest::new("space", "users", Verb::Get, "/users/42/posts/a/b/c");
        let service = api.lookup(&mut request).unwrap();
        assert_eq!(service.endpoint(), "/users/:id/posts/::rest");
        assert_eq!(request.get("id"), Some("42"));
        assert_eq!(request.get("rest"), Some("a/b/c"));

        assert_eq!(api.message(Some("en"), "greet", &["Ann"]), "Hello Ann");
        assert_eq!(api.message(Some("de"), "greet", &["Ann"]), "Bonjour Ann");
        assert_eq!(api.message(None, "bye", &[]), "Bye");
        assert_eq!(api.message(None, "unknown", &[]), "unknown");

        api.stop(false).await;
        assert_eq!(api.message(Some("en"), "bye", &[]), "bye");
    }

    #[tokio::test]
    async fn describe_honours_options() {
        let dir = tempfile::tempdir().unwrap();
        let home = write_api(
            dir.path(),
            "cat",
            &json!({"namespace": "cat", "security": {"auth": "token"}}),
            &[
                ("ok.json", json!({"endpoint": "/ok", "markers": [{"m": 1}], "group": "g"})),
                ("bad.json", json!({"endpoint": "/::a/::b"})),
            ],
        );
        let api = ApiHost::load(env(dir.path()), &home);

        let brief = api.describe(&DescribeOptions::default());
        assert_eq!(brief["services"], 2);
        assert!(brief.get("security").is_none());

        let full = api.describe(&DescribeOptions::all());
        assert_eq!(full["services"].as_array().unwrap().len(), 2);
        assert_eq!(full["failed"], 1);
        assert!(full["failedDetails"]["GET/::a/::b"]["message"].is_string());
        assert_eq!(full["markers"], 1);
        assert_eq!(full["security"]["auth"], "token");

        let grouped = api.group_services("group", None, &KeepAll);
        assert_eq!(grouped["g"]["items"].as_array().unwrap().len(), 1);
    }
}
