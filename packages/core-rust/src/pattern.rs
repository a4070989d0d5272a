//! Endpoint templates and path matching.
//!
//! A template is a `/`-separated list of segments. Literal segments match
//! themselves, `:name` (or an anonymous `*`) matches exactly one segment and
//! `::name` (or an anonymous `**`) matches one or more segments. Parameter
//! tokens are rewritten to their wildcard form, so `/users/:id/posts/::rest`
//! normalizes to `/users/*/posts/**`; the normalized form doubles as the
//! exact-match key in the service registry.

use std::fmt;

use serde::Serialize;

/// Normalized single-segment wildcard.
pub const SINGLE_WILDCARD: &str = "*";
/// Normalized multi-segment wildcard.
pub const GREEDY_WILDCARD: &str = "**";

const GREEDY_PREFIX: &str = "::";
const SINGLE_PREFIX: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("an endpoint can't contain more than 1 occurrence of '::' ({endpoint})")]
    MultipleGreedy { endpoint: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Greedy,
}

impl Token {
    fn matches(&self, segment: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == segment,
            Self::Single | Self::Greedy => !segment.is_empty(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(literal) => f.write_str(literal),
            Self::Single => f.write_str(SINGLE_WILDCARD),
            Self::Greedy => f.write_str(GREEDY_WILDCARD),
        }
    }
}

/// Named path parameter bound to a template position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accessor {
    pub name: String,
    /// Zero-based segment index in the template.
    pub index: usize,
    /// `true` when the parameter consumes every segment from `index` on.
    pub greedy: bool,
}

/// A compiled endpoint template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledEndpoint {
    raw: String,
    normalized: String,
    tokens: Vec<Token>,
    accessors: Vec<Accessor>,
    greedy_at: Option<usize>,
}

impl CompiledEndpoint {
    /// Compiles an endpoint template.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::MultipleGreedy`] if the template declares more
    /// than one multi-segment token.
    pub fn compile(raw: &str) -> Result<Self, PatternError> {
        let mut tokens = Vec::new();
        let mut accessors = Vec::new();
        let mut greedy_at = None;

        for (index, segment) in split_path(raw).enumerate() {
            let token = if let Some(name) = segment.strip_prefix(GREEDY_PREFIX) {
                if greedy_at.is_some() {
                    return Err(PatternError::MultipleGreedy {
                        endpoint: raw.to_string(),
                    });
                }
                greedy_at = Some(index);
                if !name.is_empty() {
                    accessors.push(Accessor {
                        name: name.to_string(),
                        index,
                        greedy: true,
                    });
                }
                Token::Greedy
            } else if segment == GREEDY_WILDCARD {
                if greedy_at.is_some() {
                    return Err(PatternError::MultipleGreedy {
                        endpoint: raw.to_string(),
                    });
                }
                greedy_at = Some(index);
                Token::Greedy
            } else if let Some(name) = segment.strip_prefix(SINGLE_PREFIX) {
                if !name.is_empty() {
                    accessors.push(Accessor {
                        name: name.to_string(),
                        index,
                        greedy: false,
                    });
                }
                Token::Single
            } else if segment == SINGLE_WILDCARD {
                Token::Single
            } else {
                Token::Literal(segment.to_string())
            };
            tokens.push(token);
        }

        let normalized = normalize(&tokens);
        Ok(Self {
            raw: raw.to_string(),
            normalized,
            tokens,
            accessors,
            greedy_at,
        })
    }

    /// The template as written.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The template with parameters rewritten to wildcards, always with a
    /// leading `/`.
    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    #[must_use]
    pub fn accessors(&self) -> &[Accessor] {
        &self.accessors
    }

    /// `true` when the template has at least one non-literal segment.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.tokens.iter().any(|t| !matches!(t, Token::Literal(_)))
    }

    /// Tests a request path such as `/users/42`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let segments: Vec<&str> = split_path(path).collect();
        self.matches_segments(&segments)
    }

    /// Tests pre-split request segments.
    #[must_use]
    pub fn matches_segments<S: AsRef<str>>(&self, segments: &[S]) -> bool {
        let Some(at) = self.greedy_at else {
            return segments.len() == self.tokens.len()
                && self
                    .tokens
                    .iter()
                    .zip(segments)
                    .all(|(token, segment)| token.matches(segment.as_ref()));
        };

        let prefix = &self.tokens[..at];
        let suffix = &self.tokens[at + 1..];
        // The greedy token itself needs at least one segment.
        if segments.len() < prefix.len() + suffix.len() + 1 {
            return false;
        }
        let tail = &segments[segments.len() - suffix.len()..];
        prefix
            .iter()
            .zip(segments)
            .all(|(token, segment)| token.matches(segment.as_ref()))
            && suffix
                .iter()
                .zip(tail)
                .all(|(token, segment)| token.matches(segment.as_ref()))
    }

    /// Extracts every named parameter from the segments of a matched path.
    ///
    /// Single parameters read the segment at their index; the greedy one
    /// joins every segment from its index to the end with `/`. Parameters
    /// whose index lies past the end of `segments` are skipped.
    #[must_use]
    pub fn extract<S: AsRef<str>>(&self, segments: &[S]) -> Vec<(String, String)> {
        self.accessors
            .iter()
            .filter(|accessor| accessor.index < segments.len())
            .map(|accessor| {
                let value = if accessor.greedy {
                    segments[accessor.index..]
                        .iter()
                        .map(AsRef::as_ref)
                        .collect::<Vec<_>>()
                        .join("/")
                } else {
                    segments[accessor.index].as_ref().to_string()
                };
                (accessor.name.clone(), value)
            })
            .collect()
    }
}

impl fmt::Display for CompiledEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

/// Splits a path on `/`, dropping empty segments.
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Joins segments into the `/a/b` form used as the exact-match key.
#[must_use]
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment.as_ref());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn normalize(tokens: &[Token]) -> String {
    if tokens.is_empty() {
        return "/".to_string();
    }
    tokens.iter().fold(String::new(), |mut out, token| {
        out.push('/');
        out.push_str(&token.to_string());
        out
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn segments(path: &str) -> Vec<String> {
        split_path(path).map(str::to_string).collect()
    }

    #[test]
    fn normalizes_parameter_tokens() {
        let compiled = CompiledEndpoint::compile("/users/:id/posts/::rest").unwrap();
        assert_eq!(compiled.normalized(), "/users/*/posts/**");
        assert_eq!(compiled.raw(), "/users/:id/posts/::rest");
        assert!(compiled.is_wildcard());
    }

    #[test]
    fn missing_leading_slash_is_tolerated() {
        let compiled = CompiledEndpoint::compile("users//list").unwrap();
        assert_eq!(compiled.normalized(), "/users/list");
        assert!(!compiled.is_wildcard());
        assert_eq!(CompiledEndpoint::compile("").unwrap().normalized(), "/");
    }

    #[test]
    fn accessors_record_segment_index() {
        let compiled = CompiledEndpoint::compile("/users/:id/posts/::rest").unwrap();
        assert_eq!(
            compiled.accessors(),
            &[
                Accessor {
                    name: "id".into(),
                    index: 1,
                    greedy: false
                },
                Accessor {
                    name: "rest".into(),
                    index: 3,
                    greedy: true
                },
            ]
        );
    }

    #[test]
    fn extracts_single_and_greedy_parameters() {
        let compiled = CompiledEndpoint::compile("/users/:id/posts/::rest").unwrap();
        let path = segments("/users/42/posts/a/b/c");
        assert!(compiled.matches_segments(&path));
        assert_eq!(
            compiled.extract(&path),
            vec![
                ("id".to_string(), "42".to_string()),
                ("rest".to_string(), "a/b/c".to_string()),
            ]
        );
    }

    #[test]
    fn two_greedy_tokens_are_rejected() {
        let err = CompiledEndpoint::compile("/a/::x/b/::y").unwrap_err();
        assert!(matches!(err, PatternError::MultipleGreedy { .. }));
        assert!(err.to_string().contains("more than 1 occurrence of '::'"));
        assert!(CompiledEndpoint::compile("/a/**/b/::y").is_err());
    }

    #[test]
    fn single_wildcard_matches_exactly_one_segment() {
        let compiled = CompiledEndpoint::compile("/users/:id").unwrap();
        assert!(compiled.matches("/users/7"));
        assert!(!compiled.matches("/users"));
        assert!(!compiled.matches("/users/7/extra"));
        assert!(!compiled.matches("/accounts/7"));
    }

    #[test]
    fn greedy_needs_at_least_one_segment() {
        let compiled = CompiledEndpoint::compile("/files/::path").unwrap();
        assert!(compiled.matches("/files/a"));
        assert!(compiled.matches("/files/a/b/c"));
        assert!(!compiled.matches("/files"));
    }

    #[test]
    fn greedy_in_the_middle_respects_the_suffix() {
        let compiled = CompiledEndpoint::compile("/files/::path/meta").unwrap();
        assert!(compiled.matches("/files/a/b/meta"));
        assert!(!compiled.matches("/files/meta"));
        assert!(!compiled.matches("/files/a/b/data"));
    }

    #[test]
    fn extraction_skips_accessors_past_the_end() {
        let compiled = CompiledEndpoint::compile("/a/:b/:c").unwrap();
        assert_eq!(
            compiled.extract(&["a", "1"]),
            vec![("b".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn join_path_builds_exact_key() {
        assert_eq!(join_path(&["users", "42"]), "/users/42");
        assert_eq!(join_path::<&str>(&[]), "/");
    }

    proptest! {
        #[test]
        fn literal_templates_match_only_themselves(
            parts in prop::collection::vec("[a-z]{1,6}", 1..5),
            other in "[a-z]{1,6}",
        ) {
            let path = join_path(&parts);
            let compiled = CompiledEndpoint::compile(&path).unwrap();
            prop_assert!(compiled.matches(&path));
            prop_assert_eq!(compiled.normalized(), path.as_str());

            let mut changed = parts.clone();
            changed.push(other);
            prop_assert!(!compiled.matches(&join_path(&changed)));
        }

        #[test]
        fn greedy_tail_reassembles_the_remaining_path(
            head in "[a-z]{1,6}",
            tail in prop::collection::vec("[a-z0-9]{1,6}", 1..6),
        ) {
            let compiled = CompiledEndpoint::compile(&format!("/{head}/::rest")).unwrap();
            let mut path = vec![head.clone()];
            path.extend(tail.iter().cloned());
            prop_assert!(compiled.matches_segments(&path));
            let extracted = compiled.extract(&path);
            prop_assert_eq!(extracted, vec![("rest".to_string(), tail.join("/"))]);
        }
    }
}
