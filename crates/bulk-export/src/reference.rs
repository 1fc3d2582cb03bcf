//! Path walking and reference classification.
//!
//! Rulesets name attribute paths such as `subject` or `participant.individual`.
//! [`deep_get`] resolves such a path against a document, flattening every list
//! it meets along the way, and [`references_at`] picks the `reference` strings
//! out of the resolved elements.
//!
//! A reference only counts when it is *internal*: either the relative form
//! `Type/id` (optionally `Type/id/_history/vid`) or an absolute URL that starts
//! with the export server's own base URL. References to other servers never
//! match, even when their id collides with a local one.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Resolves a dotted path against an attribute tree.
///
/// Lists are flattened at every segment, including the last one, so the result
/// contains only non-list values.
pub fn deep_get<'a>(root: &'a Map<String, Value>, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let mut out = Vec::new();
    if let Some((first, rest)) = segments.split_first() {
        if let Some(value) = root.get(*first) {
            walk(value, rest, &mut out);
        }
    }
    out
}

fn walk<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                walk(item, rest, out);
            }
        }
        _ => match rest.split_first() {
            None => out.push(value),
            Some((next, tail)) => {
                if let Some(child) = value.get(*next) {
                    walk(child, tail, out);
                }
            }
        },
    }
}

/// Returns the `reference` strings of the elements found at `path`.
pub fn references_at<'a>(root: &'a Map<String, Value>, path: &str) -> Vec<&'a str> {
    deep_get(root, path)
        .into_iter()
        .filter_map(|element| element.get("reference").and_then(Value::as_str))
        .collect()
}

/// Type-qualified identity of a resource, as in `Patient/123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// The resource type.
    pub resource_type: String,
    /// The logical id.
    pub id: String,
}

impl ResourceKey {
    /// Creates a new key.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// The export server's base URL, used to recognize absolute internal references.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerBase {
    base: Option<String>,
}

impl ServerBase {
    /// Creates a server base. A trailing `/` is ignored.
    pub fn new(url: impl AsRef<str>) -> Self {
        let base = url.as_ref().trim().trim_end_matches('/');
        Self {
            base: (!base.is_empty()).then(|| format!("{}/", base)),
        }
    }

    /// A server base that recognizes only relative references.
    pub fn relative_only() -> Self {
        Self { base: None }
    }

    /// Classifies a reference, returning its target when it is internal.
    ///
    /// # Examples
    ///
    /// ```
    /// use helios_bulk_export::reference::{ResourceKey, ServerBase};
    ///
    /// let server = ServerBase::new("https://fhir.example.org/r4");
    /// assert_eq!(
    ///     server.internal_target("Patient/123"),
    ///     Some(ResourceKey::new("Patient", "123"))
    /// );
    /// assert_eq!(
    ///     server.internal_target("https://fhir.example.org/r4/Patient/123"),
    ///     Some(ResourceKey::new("Patient", "123"))
    /// );
    /// assert_eq!(server.internal_target("https://other.example/Patient/123"), None);
    /// ```
    pub fn internal_target(&self, reference: &str) -> Option<ResourceKey> {
        let relative = match &self.base {
            Some(base) if reference.starts_with(base.as_str()) => &reference[base.len()..],
            _ => reference,
        };

        let parts: Vec<&str> = relative.split('/').collect();
        match parts.as_slice() {
            [resource_type, id] => relative_key(resource_type, id),
            [resource_type, id, "_history", version] if !version.is_empty() => {
                relative_key(resource_type, id)
            }
            _ => None,
        }
    }
}

fn relative_key(resource_type: &str, id: &str) -> Option<ResourceKey> {
    // Resource type names are upper camel case ASCII.
    let valid_type = resource_type
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
        && resource_type.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid_type || id.is_empty() {
        return None;
    }
    Some(ResourceKey::new(resource_type, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_deep_get_simple() {
        let doc = map(json!({"subject": {"reference": "Patient/1"}}));
        assert_eq!(references_at(&doc, "subject"), vec!["Patient/1"]);
    }

    #[test]
    fn test_deep_get_flattens_lists_at_every_segment() {
        let doc = map(json!({
            "participant": [
                {"individual": {"reference": "Practitioner/a"}},
                {"individual": [{"reference": "Practitioner/b"}, {"reference": "Patient/c"}]},
                {"other": true}
            ]
        }));
        assert_eq!(
            references_at(&doc, "participant.individual"),
            vec!["Practitioner/a", "Practitioner/b", "Patient/c"]
        );
    }

    #[test]
    fn test_deep_get_missing_path() {
        let doc = map(json!({"subject": {"display": "no reference"}}));
        assert!(references_at(&doc, "subject").is_empty());
        assert!(references_at(&doc, "performer").is_empty());
        assert!(references_at(&doc, "subject.deeper.still").is_empty());
        assert!(deep_get(&doc, "").is_empty());
    }

    #[test]
    fn test_internal_classification() {
        let server = ServerBase::new("https://fhir.example.org/r4/");
        assert_eq!(
            server.internal_target("Observation/o1/_history/2"),
            Some(ResourceKey::new("Observation", "o1"))
        );
        assert_eq!(server.internal_target("https://other.example/Patient/123"), None);
        assert_eq!(server.internal_target("urn:uuid:1234"), None);
        assert_eq!(server.internal_target("#contained"), None);
        assert_eq!(server.internal_target("Patient/"), None);
        assert_eq!(server.internal_target("Patient"), None);
    }

    #[test]
    fn test_relative_only_rejects_absolute() {
        let server = ServerBase::relative_only();
        assert_eq!(server.internal_target("https://fhir.example.org/r4/Patient/1"), None);
        assert!(server.internal_target("Patient/1").is_some());
    }

    #[test]
    fn test_resource_key_display() {
        assert_eq!(ResourceKey::new("Group", "g1").to_string(), "Group/g1");
    }
}
