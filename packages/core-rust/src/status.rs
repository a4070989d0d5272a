//! Lifecycle status shared by apis and services, plus the failure record
//! attached to components that land in `Failed`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of an api or a service.
///
/// Persisted as the literal strings `Stopped`, `Paused`, `Running` and
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Stopped,
    Paused,
    Running,
    Failed,
}

impl Status {
    /// Returns the persisted representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Paused => "Paused",
            Self::Running => "Running",
            Self::Failed => "Failed",
        }
    }

    /// `true` for `Running` and `Paused`, the statuses that are restored
    /// automatically after a restart.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the four status literals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Stopped" => Ok(Self::Stopped),
            "Paused" => Ok(Self::Paused),
            "Running" => Ok(Self::Running),
            "Failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Captured cause of a component landing in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<String>>,
}

impl Failure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    /// Builds a failure from an error, keeping its source chain as the trace.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            trace: if trace.is_empty() { None } else { Some(trace) },
        }
    }

    /// Same as [`Failure::from_error`] for `anyhow` errors, which carry
    /// their context chain separately.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let trace: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        Self {
            message: err.to_string(),
            trace: if trace.is_empty() { None } else { Some(trace) },
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
