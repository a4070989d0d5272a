//! Localized message bundles.
//!
//! Bundles are JSON files under `resources/messages` shaped
//! `{"key": {"en": "...", "fr": "..."}}`. Later files override earlier ones
//! key by key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;
use spaceport_core::{document, DocumentError};

#[derive(Debug, Default, Clone)]
pub struct Messages {
    /// key -> language -> message
    entries: HashMap<String, HashMap<String, String>>,
}

impl Messages {
    /// # Errors
    ///
    /// Returns the first bundle that can't be read or parsed.
    pub fn load(files: &[PathBuf]) -> Result<Self, DocumentError> {
        let mut messages = Self::default();
        for file in files {
            messages.merge(&document::load(file)?);
        }
        Ok(messages)
    }

    /// Merges one bundle. Entries that aren't string translations are
    /// skipped.
    pub fn merge(&mut self, bundle: &Value) {
        let Some(keys) = bundle.as_object() else {
            return;
        };
        for (key, translations) in keys {
            let Some(translations) = translations.as_object() else {
                continue;
            };
            let entry = self.entries.entry(key.clone()).or_default();
            for (lang, text) in translations {
                if let Some(text) = text.as_str() {
                    entry.insert(lang.clone(), text.to_string());
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, lang: &str, key: &str) -> Option<&str> {
        self.entries.get(key)?.get(lang).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(\d+)\}").expect("placeholder pattern compiles"))
}

/// Replaces `{0}`, `{1}`, ... with positional arguments. Placeholders
/// without an argument are kept as written.
#[must_use]
pub fn format_message(template: &str, args: &[&str]) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| args.get(i))
                .map_or_else(|| caps[0].to_string(), |arg| (*arg).to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn later_bundles_override_per_language() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, r#"{"hello": {"en": "Hello", "fr": "Bonjour"}}"#).unwrap();
        std::fs::write(&b, r#"{"hello": {"en": "Hi"}, "bye": {"en": "Bye"}}"#).unwrap();

        let messages = Messages::load(&[a, b]).unwrap();
        assert_eq!(messages.get("en", "hello"), Some("Hi"));
        assert_eq!(messages.get("fr", "hello"), Some("Bonjour"));
        assert_eq!(messages.len(), 2);
        assert!(messages.get("de", "hello").is_none());
    }

    #[test]
    fn non_string_translations_are_skipped() {
        let mut messages = Messages::default();
        messages.merge(&json!({"a": {"en": 1}, "b": "flat"}));
        assert!(messages.get("en", "a").is_none());
        assert!(messages.get("en", "b").is_none());
    }

    #[test]
    fn format_fills_positional_placeholders() {
        assert_eq!(format_message("{0} has {1} items", &["cart", "3"]), "cart has 3 items");
        assert_eq!(format_message("missing {2}", &["a"]), "missing {2}");
        assert_eq!(format_message("no placeholders", &[]), "no placeholders");
    }
}
