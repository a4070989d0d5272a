//! Namespace and identifier rules shared by spaces, apis and services.

use std::sync::OnceLock;

use regex::Regex;

fn namespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]*$").expect("namespace pattern compiles"))
}

/// Space and api namespaces are non-empty and limited to ASCII letters,
/// digits, `_` and `-`.
#[must_use]
pub fn is_valid_namespace(ns: &str) -> bool {
    !ns.is_empty() && namespace_pattern().is_match(ns)
}

/// A resource path element: same alphabet as namespaces plus `.` for file
/// extensions, never `.` or `..` alone.
#[must_use]
pub fn is_valid_path_element(element: &str) -> bool {
    !element.is_empty()
        && element != "."
        && element != ".."
        && element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Derives a stable service id from its descriptor path, e.g.
/// `services/users/get.json` becomes `Users.Get`.
#[must_use]
pub fn service_id_from_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let trimmed = trimmed.strip_prefix("services/").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(".json").unwrap_or(trimmed);
    trimmed
        .split(['/', '\\'])
        .filter(|p| !p.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(".")
}

fn capitalize(part: &str) -> String {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces() {
        assert!(is_valid_namespace("billing-v2_eu"));
        assert!(!is_valid_namespace(""));
        assert!(!is_valid_namespace("bad ns"));
        assert!(!is_valid_namespace("a.b"));
    }

    #[test]
    fn path_elements() {
        assert!(is_valid_path_element("logo.png"));
        assert!(!is_valid_path_element(".."));
        assert!(!is_valid_path_element("a b"));
    }

    #[test]
    fn service_ids_are_derived_from_paths() {
        assert_eq!(service_id_from_path("services/users/get.json"), "Users.Get");
        assert_eq!(service_id_from_path("/services/orders/byId/find.json"), "Orders.ById.Find");
        assert_eq!(service_id_from_path("ping.json"), "Ping");
    }
}
