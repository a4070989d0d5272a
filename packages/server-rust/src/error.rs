use spaceport_core::{DocumentError, Status, Verb};

/// Errors from lifecycle and management commands.
///
/// Always returned to the caller; component faults that happen while loading
/// or starting are recorded on the component instead (see `Failure`).
#[derive(Debug, thiserror::Error)]
pub enum ManagementError {
    #[error("space {0} not found")]
    SpaceNotFound(String),
    #[error("space {0} already exists")]
    SpaceExists(String),
    #[error("api {api} not found in space {space}")]
    ApiNotFound { space: String, api: String },
    #[error("service {verb} {endpoint} not found in api {api}")]
    ServiceNotFound {
        api: String,
        verb: Verb,
        endpoint: String,
    },
    #[error("invalid namespace {0}")]
    InvalidNamespace(String),
    #[error("can't {action} {subject}. Status={current}, expected {expected}")]
    InvalidState {
        action: &'static str,
        subject: String,
        current: Status,
        expected: &'static str,
    },
    #[error("{subject} failed to start: {source}")]
    StartFailed {
        subject: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("space {0} is blocked")]
    Blocked(String),
    #[error("feature {kind}/{name} not found in space {space}")]
    FeatureNotFound {
        space: String,
        kind: String,
        name: String,
    },
    #[error("feature {kind}/{name} already exists in space {space}")]
    FeatureExists {
        space: String,
        kind: String,
        name: String,
    },
    #[error("feature provider {0} not found")]
    ProviderNotFound(String),
    #[error("invalid resource path {0}")]
    InvalidResource(String),
    #[error("{0} is required")]
    MissingPayload(&'static str),
    #[error("unsupported archive {0}")]
    UnsupportedArchive(String),
    #[error("request rejected by validator: {0}")]
    Validation(#[source] anyhow::Error),
    #[error("plugin failure: {0}")]
    Plugin(#[source] anyhow::Error),
    #[error("status store failure: {0}")]
    StatusStore(#[source] anyhow::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl ManagementError {
    pub(crate) fn invalid_state(
        action: &'static str,
        subject: impl Into<String>,
        current: Status,
        expected: &'static str,
    ) -> Self {
        Self::InvalidState {
            action,
            subject: subject.into(),
            current,
            expected,
        }
    }
}

/// Errors raised by the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution rejected: queue still full after waiting {waited_ms}ms")]
    Rejected { waited_ms: u64 },
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("execution cancelled")]
    Cancelled,
    #[error("execution failed: {0}")]
    Failed(#[source] anyhow::Error),
    #[error("execution engine is not running")]
    NotRunning,
}
