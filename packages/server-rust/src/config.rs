//! Runtime configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a [`crate::runtime::Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory; spaces live under `<root>/spaces/<namespace>`.
    pub root: PathBuf,
    /// Folder holding api archives that can be installed by name.
    pub external_spaces: Option<PathBuf>,
    /// Status persistence settings applied to every space.
    pub status: StatusStoreConfig,
    /// Worker pool used by spaces whose descriptor has no `executor`
    /// section. `None` runs every unit inline.
    pub executor: Option<ExecutorConfig>,
    /// Language used when a message isn't available in the requested one.
    pub default_language: String,
}

impl RuntimeConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn spaces_dir(&self) -> PathBuf {
        self.root.join("spaces")
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            external_spaces: None,
            status: StatusStoreConfig::default(),
            executor: Some(ExecutorConfig::default()),
            default_language: "en".to_string(),
        }
    }
}

/// Settings for the per-space status file.
#[derive(Debug, Clone)]
pub struct StatusStoreConfig {
    /// Period of the background flush.
    pub flush_interval: Duration,
    /// Keep status changes in memory only.
    pub read_only: bool,
    /// File name inside the space directory.
    pub file_name: String,
}

impl Default for StatusStoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(20),
            read_only: false,
            file_name: "status.json".to_string(),
        }
    }
}

/// Priority band recorded for a worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Min,
    #[default]
    Norm,
    Max,
}

/// Worker pool settings, read from the `executor` section of a space
/// descriptor. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub core_size: usize,
    pub max_size: usize,
    /// Idle time after which workers beyond `core_size` exit.
    pub keep_alive: u64,
    /// Bounded queue capacity.
    pub queue: usize,
    /// Wait bound for `AsyncWait` executions.
    pub timeout: u64,
    /// How long shutdown waits for workers, once before and once after
    /// cancelling in-flight units.
    pub await_termination: u64,
    /// How long a submitter waits for queue space before rejection.
    pub reject_wait: u64,
    pub group: String,
    pub priority: Priority,
}

impl ExecutorConfig {
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    #[must_use]
    pub fn await_termination(&self) -> Duration {
        Duration::from_millis(self.await_termination)
    }

    #[must_use]
    pub fn reject_wait(&self) -> Duration {
        Duration::from_millis(self.reject_wait)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            core_size: 10,
            max_size: 10,
            keep_alive: 0,
            queue: 10,
            timeout: 600_000,
            await_termination: 60_000,
            reject_wait: 5_000,
            group: "DefaultGroup".to_string(),
            priority: Priority::Norm,
        }
    }
}
