//! Grouping of service descriptors by a descriptor property, used to build
//! catalogs such as documentation indexes.

use serde_json::{Map, Value};
use spaceport_core::document;

use super::Service;

/// Group name for services that don't define the grouping property.
pub const DEFAULT_GROUP: &str = "default";

/// Hooks that rewrite or filter groups and entries. Returning `None` drops
/// the group or the entry.
pub trait GroupingFlow: Send + Sync {
    fn on_group_key(&self, _api: &str, key: String) -> Option<String> {
        Some(key)
    }

    fn on_service(&self, _api: &str, _service: &Service, entry: Value, _is_object_type: bool) -> Option<Value> {
        Some(entry)
    }
}

/// Keeps every group and entry unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAll;

impl GroupingFlow for KeepAll {}

/// Groups `services` by the value at `property` in their descriptor.
///
/// With `item_key` each group is an object keyed by the entry value at that
/// path (falling back to the service id); without it, entries are collected
/// under an `items` array.
pub fn group_by(
    api: &str,
    services: &[std::sync::Arc<Service>],
    property: &str,
    item_key: Option<&str>,
    flow: &dyn GroupingFlow,
    is_object_type: &dyn Fn(&Service) -> bool,
) -> Value {
    let mut groups = Map::new();
    for service in services {
        let key = document::find(service.descriptor(), property)
            .map_or_else(|| DEFAULT_GROUP.to_string(), value_to_key);
        let Some(key) = flow.on_group_key(api, key) else {
            continue;
        };
        let Some(entry) = flow.on_service(api, service, service.descriptor().clone(), is_object_type(service))
        else {
            continue;
        };

        let group = groups
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(group) = group.as_object_mut() else {
            continue;
        };
        match item_key {
            Some(item_key) => {
                let id = document::find(&entry, item_key)
                    .map_or_else(|| service.id().to_string(), value_to_key);
                group.insert(id, entry);
            }
            None => {
                if let Value::Array(items) = group
                    .entry("items")
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    items.push(entry);
                }
            }
        }
    }
    Value::Object(groups)
}

fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn service(descriptor: Value) -> Arc<Service> {
        Arc::new(Service::from_descriptor("services/x.json", descriptor).unwrap())
    }

    #[test]
    fn groups_by_property_into_items() {
        let services = vec![
            service(json!({"endpoint": "/a", "id": "A", "meta": {"tag": "users"}})),
            service(json!({"endpoint": "/b", "id": "B", "meta": {"tag": "users"}})),
            service(json!({"endpoint": "/c", "id": "C"})),
        ];
        let grouped = group_by("api", &services, "meta.tag", None, &KeepAll, &|_| false);
        assert_eq!(grouped["users"]["items"].as_array().unwrap().len(), 2);
        assert_eq!(grouped[DEFAULT_GROUP]["items"][0]["id"], "C");
    }

    #[test]
    fn item_key_and_flow_filtering() {
        struct OnlyObjects;
        impl GroupingFlow for OnlyObjects {
            fn on_group_key(&self, _api: &str, key: String) -> Option<String> {
                Some(key.to_uppercase())
            }
            fn on_service(&self, _api: &str, _s: &Service, entry: Value, is_object: bool) -> Option<Value> {
                is_object.then_some(entry)
            }
        }

        let services = vec![
            service(json!({"endpoint": "/a", "id": "A", "tag": "t", "spec": {"type": "Order"}})),
            service(json!({"endpoint": "/b", "id": "B", "tag": "t", "spec": {"type": "string"}})),
        ];
        let is_object = |s: &Service| document::get_str(s.descriptor(), "spec.type") == Some("Order");
        let grouped = group_by("api", &services, "tag", Some("id"), &OnlyObjects, &is_object);
        assert_eq!(grouped, json!({"T": {"A": services[0].descriptor().clone()}}));
    }
}
