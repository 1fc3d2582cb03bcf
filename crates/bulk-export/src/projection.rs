//! Type allow-listing and field projection.
//!
//! Strips the document store's bookkeeping attributes and duplicates
//! `resourceType` under [`PARTITION_KEY_FIELD`], which the shard writer uses as
//! the partition column and removes again from the emitted lines.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde_json::Value;

use crate::document::{DOCUMENT_STATUS_FIELD, Document, VersionOrdering};
use crate::filter::ExportWindow;
use crate::tenant::TENANT_ID_FIELD;

/// Output-only attribute carrying the partition key.
pub const PARTITION_KEY_FIELD: &str = "resourceTypeDup";

/// Attributes that exist only for the document store's own bookkeeping.
pub const INTERNAL_FIELDS: &[&str] = &[
    DOCUMENT_STATUS_FIELD,
    "lockEndTs",
    "vid",
    "_references",
    TENANT_ID_FIELD,
    "_subscriptionStatus",
];

/// Projects one document for emission.
pub fn project(document: &Document) -> Document {
    let stripped = document.without_attrs(INTERNAL_FIELDS);
    let resource_type = Value::String(stripped.resource_type().to_string());
    stripped.with_attr(PARTITION_KEY_FIELD, resource_type)
}

/// Applies the window's type allow-list, removes duplicate documents and
/// projects the rest.
///
/// Duplicates share resource type, id and version; the last one seen is kept.
/// The result is ordered by `(resource type, id, version)`.
pub fn project_all(documents: Vec<Document>, window: &ExportWindow) -> Vec<Document> {
    let mut unique: BTreeMap<(String, String, VersionKey), Document> = BTreeMap::new();
    for document in documents {
        if !window.allows_type(document.resource_type()) {
            continue;
        }
        let key = (
            document.resource_type().to_string(),
            document.id().to_string(),
            VersionKey(document.version_id()),
        );
        unique.insert(key, document);
    }

    unique
        .into_values()
        .collect::<Vec<_>>()
        .par_iter()
        .map(project)
        .collect()
}

/// Version identifier ordered numerically where possible.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionKey(Option<String>);

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        VersionOrdering::Numeric
            .compare(self.0.as_deref(), other.0.as_deref())
            .then_with(|| self.0.cmp(&other.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn window() -> ExportWindow {
        ExportWindow::parse("2024-01-01T00:00:00.000Z", "2024-02-01T00:00:00.000Z").unwrap()
    }

    #[test]
    fn test_project_strips_internal_fields() {
        let d = doc(json!({
            "resourceType": "Patient",
            "id": "p1",
            "documentStatus": "AVAILABLE",
            "lockEndTs": 1700000000000u64,
            "vid": 2,
            "_references": ["Organization/o1"],
            "_tenantId": "t1",
            "_id": {"extension": [{"url": "http://example.org/source", "valueString": "mpi"}]},
            "_subscriptionStatus": "active",
            "meta": {"versionId": "2"}
        }));
        let projected = project(&d);
        for field in INTERNAL_FIELDS {
            assert!(projected.get(field).is_none(), "{field} should be dropped");
        }
        assert!(projected.get("_id").is_some(), "id extension must survive");
        assert_eq!(projected.str_attr(PARTITION_KEY_FIELD), Some("Patient"));
        assert_eq!(projected.str_attr("resourceType"), Some("Patient"));
        assert!(projected.get("meta").is_some());
    }

    #[test]
    fn test_project_all_type_list_and_dedup() {
        let docs = vec![
            doc(json!({"resourceType": "Patient", "id": "p1", "vid": 1, "name": "first"})),
            doc(json!({"resourceType": "Patient", "id": "p1", "vid": 1, "name": "second"})),
            doc(json!({"resourceType": "Patient", "id": "p1", "vid": 2})),
            doc(json!({"resourceType": "Encounter", "id": "e1", "vid": 1})),
        ];
        let projected = project_all(docs.clone(), &window().with_types(["Patient"]));
        assert_eq!(projected.len(), 2);
        assert_eq!(projected[0].str_attr("name"), Some("second"));

        let everything = project_all(docs, &window());
        let types: Vec<&str> = everything.iter().map(|d| d.resource_type()).collect();
        assert_eq!(types, vec!["Encounter", "Patient", "Patient"]);
    }

    #[test]
    fn test_version_key_numeric_order() {
        assert!(VersionKey(Some("10".into())) > VersionKey(Some("9".into())));
        assert!(VersionKey(None) < VersionKey(Some("1".into())));
    }
}
