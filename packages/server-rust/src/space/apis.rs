//! Api installation, api and service lifecycle commands, and request
//! dispatch.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use spaceport_core::{ApiContext, ApiRequest, Failure, Status, Verb};

use super::SpaceHost;
use crate::api::{ApiHost, DESCRIPTOR_FILE};
use crate::error::ManagementError;
use crate::executor::{ExecutionHandle, ExecutionMode};
use crate::plugins::{Event, Subject};
use crate::services::Service;
use crate::spi::{NoopServiceSpi, ServiceSpi};
use crate::status::StatusStore;

impl SpaceHost {
    // -- installation --------------------------------------------------------

    /// Unpacks an api archive into a fresh folder of the space and installs
    /// it. The folder is named after `name` (or the space) plus a unique
    /// suffix.
    ///
    /// # Errors
    ///
    /// Fails if the archive can't be unpacked, or see
    /// [`SpaceHost::install_dir`].
    pub async fn install_archive(
        &self,
        mut reader: impl Read + Send + 'static,
        name: Option<&str>,
    ) -> Result<Arc<ApiHost>, ManagementError> {
        let base = name.filter(|n| !n.is_empty()).unwrap_or(self.namespace.as_str());
        let folder = format!("{base}_{}", uuid::Uuid::new_v4().simple());
        let target = self.home.join(folder);
        tracing::info!(space = %self.namespace, target = %target.display(), "installing api archive");

        let codec = Arc::clone(&self.host.codec);
        let unpack_into = target.clone();
        let unpacked = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&unpack_into)?;
            codec
                .decompress(&mut reader, &unpack_into)
                .map_err(std::io::Error::other)
        })
        .await
        .map_err(std::io::Error::other)?;
        if let Err(e) = unpacked {
            if let Err(cleanup) = std::fs::remove_dir_all(&target) {
                tracing::warn!(space = %self.namespace, error = %cleanup, "failed to remove partial install");
            }
            return Err(e.into());
        }

        self.install_dir(api_root(&target)).await
    }

    /// Installs the archive `api_file` found in `space_folder` under the
    /// runtime's external spaces folder.
    ///
    /// # Errors
    ///
    /// [`ManagementError::UnsupportedArchive`] if no external folder is
    /// configured, the file is missing or its format unknown.
    pub async fn install_from(&self, space_folder: &str, api_file: &str) -> Result<Arc<ApiHost>, ManagementError> {
        let unsupported = || ManagementError::UnsupportedArchive(format!("{space_folder}/{api_file}"));
        let external = self.config.external_spaces.as_ref().ok_or_else(unsupported)?;
        if !self.host.codec.supports(api_file) {
            return Err(unsupported());
        }
        let file = external.join(space_folder).join(api_file);
        if !file.is_file() {
            return Err(unsupported());
        }
        let name = Path::new(api_file)
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .map(str::to_string);
        let reader = std::fs::File::open(&file)?;
        self.install_archive(reader, name.as_deref()).await
    }

    /// Loads the api in `home` and registers it, replacing any installed
    /// api with the same namespace. A replaced api is stopped first and its
    /// persisted status is carried over to the new instance.
    ///
    /// # Errors
    ///
    /// [`ManagementError::Plugin`] if a plugin rejects the install; the api
    /// is unregistered again.
    pub async fn install_dir(&self, home: impl Into<PathBuf>) -> Result<Arc<ApiHost>, ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.install_locked(home.into()).await
    }

    async fn install_locked(&self, home: PathBuf) -> Result<Arc<ApiHost>, ManagementError> {
        let api = Arc::new(ApiHost::load(self.api_env(), home));
        let namespace = api.namespace().to_string();
        let restore = self.status.get(&namespace);

        if let Some((_, old)) = self.apis.remove(&namespace) {
            tracing::info!(space = %self.namespace, api = %namespace, "replacing installed api");
            if old.status().is_active() {
                old.stop(false).await;
            }
            old.clear();
            old.release();
            self.status.delete(&namespace);
            // A stopped space restores the new instance on its next start.
            if let Some(status) = restore.filter(|_| !self.is_started()) {
                self.status.update(&namespace, status);
            }
            if old.home() != api.home() {
                remove_home(&self.namespace, old.home());
            }
        }

        self.apis.insert(namespace.clone(), Arc::clone(&api));
        if let Err(e) = self.host.plugins.on_event(Event::Install, &Subject::Api(&api)).await {
            self.apis.remove(&namespace);
            return Err(ManagementError::Plugin(e));
        }
        tracing::info!(
            space = %self.namespace,
            api = %namespace,
            status = %api.status(),
            restore = ?restore,
            "api installed"
        );

        if self.is_started() && api.status() != Status::Failed {
            match restore {
                Some(Status::Running) => {
                    api.start(false).await;
                }
                Some(Status::Paused) => {
                    api.start(true).await;
                }
                _ => {}
            }
        }
        Ok(api)
    }

    /// Stops and removes an api together with its status and files.
    ///
    /// # Errors
    ///
    /// [`ManagementError::ApiNotFound`] or [`ManagementError::Plugin`] if a
    /// plugin rejects the uninstall.
    pub async fn uninstall(&self, namespace: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        let api = self.require_api(namespace)?;
        self.host
            .plugins
            .on_event(Event::Uninstall, &Subject::Api(&api))
            .await
            .map_err(ManagementError::Plugin)?;

        if api.status() != Status::Stopped {
            api.stop(false).await;
        }
        self.status.delete(namespace);
        api.release();
        api.clear();
        remove_home(&self.namespace, api.home());
        self.apis.remove(namespace);
        tracing::info!(space = %self.namespace, api = namespace, "api uninstalled");
        Ok(())
    }

    // -- api lifecycle -------------------------------------------------------

    /// Starts a stopped api or resumes a paused one. No-op when running.
    ///
    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] on a `Failed` api and
    /// [`ManagementError::StartFailed`] if starting fails.
    pub async fn start_api(&self, namespace: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        let api = self.require_api(namespace)?;
        match api.status() {
            Status::Running => Ok(()),
            Status::Failed => Err(ManagementError::invalid_state(
                "start",
                format!("api {namespace}"),
                Status::Failed,
                "Stopped or Paused",
            )),
            Status::Paused => {
                api.resume();
                Ok(())
            }
            Status::Stopped => {
                if api.start(false).await == Status::Failed {
                    let failure = api.failure().unwrap_or_else(|| Failure::new("unknown failure"));
                    return Err(ManagementError::StartFailed {
                        subject: format!("api {namespace}"),
                        source: anyhow::anyhow!(failure.message),
                    });
                }
                Ok(())
            }
        }
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] unless the api is `Running`.
    pub async fn stop_api(&self, namespace: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        let api = self.require_api_status(namespace, "stop", Status::Running)?;
        api.stop(true).await;
        Ok(())
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] unless the api is `Running`.
    pub async fn pause_api(&self, namespace: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.require_api_status(namespace, "pause", Status::Running)?.pause();
        Ok(())
    }

    /// # Errors
    ///
    /// [`ManagementError::InvalidState`] unless the api is `Paused`.
    pub async fn resume_api(&self, namespace: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.require_api_status(namespace, "resume", Status::Paused)?.resume();
        Ok(())
    }

    // -- service lifecycle ---------------------------------------------------

    /// # Errors
    ///
    /// The api must be started; see [`crate::services::ServiceRegistry::start`].
    pub async fn start_service(&self, namespace: &str, verb: Verb, endpoint: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        let api = self.require_api(namespace)?;
        let module = api.module().ok_or_else(|| {
            ManagementError::invalid_state(
                "start a service of",
                format!("api {namespace}"),
                api.status(),
                "Running or Paused",
            )
        })?;
        api.services().start(verb, endpoint, &module).await
    }

    /// # Errors
    ///
    /// See [`crate::services::ServiceRegistry::stop`].
    pub async fn stop_service(&self, namespace: &str, verb: Verb, endpoint: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.require_api(namespace)?.services().stop(verb, endpoint).await
    }

    /// # Errors
    ///
    /// See [`crate::services::ServiceRegistry::pause`].
    pub async fn pause_service(&self, namespace: &str, verb: Verb, endpoint: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.require_api(namespace)?.services().pause(verb, endpoint)
    }

    /// # Errors
    ///
    /// See [`crate::services::ServiceRegistry::resume`].
    pub async fn resume_service(&self, namespace: &str, verb: Verb, endpoint: &str) -> Result<(), ManagementError> {
        let _guard = self.lifecycle.lock().await;
        self.require_api(namespace)?.services().resume(verb, endpoint)
    }

    // -- requests ------------------------------------------------------------

    /// Resolves the api and service for `request` and binds its path
    /// parameters.
    ///
    /// # Errors
    ///
    /// [`ManagementError::ApiNotFound`] or
    /// [`ManagementError::ServiceNotFound`].
    pub fn lookup(&self, request: &mut ApiRequest) -> Result<(Arc<ApiHost>, Arc<Service>), ManagementError> {
        let api = self.require_api(&request.api)?;
        let service = api.lookup(request).ok_or_else(|| ManagementError::ServiceNotFound {
            api: request.api.clone(),
            verb: request.verb,
            endpoint: request.endpoint.clone(),
        })?;
        Ok((api, service))
    }

    /// Routes `request` and runs its service on the space's engine.
    ///
    /// # Errors
    ///
    /// Rejects requests to a blocked space, to an api or service that isn't
    /// `Running`, and requests the validator refuses. Engine errors are
    /// wrapped in [`ManagementError::Execution`].
    pub async fn call(
        &self,
        mut request: ApiRequest,
        ctx: Arc<ApiContext>,
        mode: ExecutionMode,
    ) -> Result<ExecutionHandle<serde_json::Value>, ManagementError> {
        if self.is_blocked() {
            return Err(ManagementError::Blocked(self.namespace.clone()));
        }
        let (api, service) = self.lookup(&mut request)?;
        if api.status() != Status::Running {
            return Err(ManagementError::invalid_state(
                "call",
                format!("api {}", api.namespace()),
                api.status(),
                "Running",
            ));
        }
        if service.status() != Status::Running {
            return Err(ManagementError::invalid_state(
                "call",
                format!("service {} {}", service.verb(), service.endpoint()),
                service.status(),
                "Running",
            ));
        }
        api.validate(&service, &request)?;

        let spi: Arc<dyn ServiceSpi> = service.spi().unwrap_or_else(|| Arc::new(NoopServiceSpi));
        let info = request.info();
        tracing::debug!(
            space = %self.namespace,
            api = %api.namespace(),
            verb = %request.verb,
            endpoint = %request.endpoint,
            "dispatching request"
        );
        let handle = self
            .engine
            .execute_request(info, service.function_ref(), mode, move |_token| async move {
                spi.execute(&request, &ctx).await
            })
            .await?;
        Ok(handle)
    }

    // -- helpers -------------------------------------------------------------

    fn require_api(&self, namespace: &str) -> Result<Arc<ApiHost>, ManagementError> {
        self.api(namespace).ok_or_else(|| ManagementError::ApiNotFound {
            space: self.namespace.clone(),
            api: namespace.to_string(),
        })
    }

    fn require_api_status(
        &self,
        namespace: &str,
        action: &'static str,
        expected: Status,
    ) -> Result<Arc<ApiHost>, ManagementError> {
        let api = self.require_api(namespace)?;
        let current = api.status();
        if current != expected {
            return Err(ManagementError::invalid_state(
                action,
                format!("api {namespace}"),
                current,
                expected.as_str(),
            ));
        }
        Ok(api)
    }
}

/// Archives may wrap the api in a single top-level folder.
fn api_root(target: &Path) -> PathBuf {
    if target.join(DESCRIPTOR_FILE).is_file() {
        return target.to_path_buf();
    }
    let Ok(entries) = std::fs::read_dir(target) else {
        return target.to_path_buf();
    };
    let dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    match dirs.as_slice() {
        [only] if only.join(DESCRIPTOR_FILE).is_file() => only.clone(),
        _ => target.to_path_buf(),
    }
}

fn remove_home(space: &str, home: &Path) {
    if let Err(e) = std::fs::remove_dir_all(home) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(space, home = %home.display(), error = %e, "failed to remove api home");
        }
    }
}
