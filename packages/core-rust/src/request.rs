use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pattern::{join_path, split_path};
use crate::verb::Verb;

/// A request routed to a service: where it goes, the path parameters
/// resolved for it and its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub id: String,
    pub space: String,
    pub api: String,
    pub verb: Verb,
    /// Request path without the space and api prefix.
    pub endpoint: String,
    pub segments: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

impl ApiRequest {
    #[must_use]
    pub fn new(space: impl Into<String>, api: impl Into<String>, verb: Verb, path: &str) -> Self {
        let segments: Vec<String> = split_path(path).map(str::to_string).collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            space: space.into(),
            api: api.into(),
            verb,
            endpoint: join_path(&segments),
            segments,
            parameters: BTreeMap::new(),
            payload: Value::Null,
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Summary kept by workers while they serve this request.
    #[must_use]
    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id.clone(),
            verb: self.verb,
            endpoint: self.endpoint.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Identifies an in-flight request in worker introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub id: String,
    pub verb: Verb,
    pub endpoint: String,
    pub timestamp: u64,
}

/// Milliseconds since the unix epoch, saturating on clock errors.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_splits_and_normalizes_the_path() {
        let request = ApiRequest::new("acme", "billing", Verb::Get, "invoices//42/");
        assert_eq!(request.segments, vec!["invoices", "42"]);
        assert_eq!(request.endpoint, "/invoices/42");
        assert!(!request.id.is_empty());
        assert!(request.timestamp > 0);
    }

    #[test]
    fn parameters_are_settable() {
        let mut request = ApiRequest::new("acme", "billing", Verb::Post, "/invoices");
        request.set("id", "42");
        assert_eq!(request.get("id"), Some("42"));
        assert_eq!(request.get("missing"), None);
    }

    #[test]
    fn info_mirrors_the_request() {
        let request = ApiRequest::new("acme", "billing", Verb::Delete, "/invoices/1");
        let info = request.info();
        assert_eq!(info.id, request.id);
        assert_eq!(info.verb, Verb::Delete);
        assert_eq!(info.endpoint, "/invoices/1");
    }
}
