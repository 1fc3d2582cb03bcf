//! Compartment inclusion.
//!
//! A document belongs to a group export when it is itself a member (or was
//! pulled in as a transitive reference), or when one of the compartment paths
//! configured for its type holds an internal reference to a group patient.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{ConfigError, ExportResult};
use crate::group::GroupMembership;
use crate::reference::{ResourceKey, ServerBase, references_at};

/// Paths, per resource type, whose references place a document in a
/// patient's compartment.
///
/// Stored as JSON: `{"Observation": ["subject", "performer"], ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompartmentRuleset(BTreeMap<String, Vec<String>>);

impl CompartmentRuleset {
    /// Creates a ruleset from `(resource type, paths)` pairs.
    pub fn new<I, T, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, Vec<P>)>,
        T: Into<String>,
        P: Into<String>,
    {
        Self(
            entries
                .into_iter()
                .map(|(t, paths)| (t.into(), paths.into_iter().map(Into::into).collect()))
                .collect(),
        )
    }

    /// Parses the ruleset document.
    pub fn from_json(bytes: &[u8]) -> ExportResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            ConfigError::InvalidRuleset {
                name: "compartment".to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Returns the paths for a resource type.
    pub fn paths(&self, resource_type: &str) -> Option<&[String]> {
        self.0.get(resource_type).map(Vec::as_slice)
    }

    /// Returns the number of resource types with rules.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decides compartment membership for the documents of one run.
///
/// The engine is immutable once built and its predicate touches no shared
/// mutable state, so it can be evaluated over any partitioning of the input.
#[derive(Debug, Clone)]
pub struct CompartmentEngine<'a> {
    membership: &'a GroupMembership,
    rules: &'a CompartmentRuleset,
    server: &'a ServerBase,
}

impl<'a> CompartmentEngine<'a> {
    /// Creates an engine for a resolved group.
    pub fn new(
        membership: &'a GroupMembership,
        rules: &'a CompartmentRuleset,
        server: &'a ServerBase,
    ) -> Self {
        Self {
            membership,
            rules,
            server,
        }
    }

    /// Returns true if the document references a group patient through one of
    /// its compartment paths.
    pub fn in_patient_compartment(&self, document: &Document) -> bool {
        let Some(paths) = self.rules.paths(document.resource_type()) else {
            return false;
        };
        paths.iter().any(|path| {
            references_at(document.as_map(), path)
                .into_iter()
                .filter_map(|reference| self.server.internal_target(reference))
                .any(|target| self.membership.is_patient(&target))
        })
    }

    /// Tests one document against the membership, the extra seed keys and the
    /// compartment rules.
    pub fn includes(&self, document: &Document, extra: &BTreeSet<ResourceKey>) -> bool {
        let key = ResourceKey::new(document.resource_type(), document.id());
        self.membership.is_member(&key) || extra.contains(&key) || self.in_patient_compartment(document)
    }

    /// Selects the included documents, preserving input order.
    pub fn select(&self, documents: &[Document], extra: &BTreeSet<ResourceKey>) -> Vec<Document> {
        documents
            .par_iter()
            .filter(|document| self.includes(document, extra))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn membership() -> GroupMembership {
        let p1 = ResourceKey::new("Patient", "123");
        GroupMembership {
            members: [p1.clone(), ResourceKey::new("Practitioner", "d1")].into_iter().collect(),
            patients: [p1].into_iter().collect(),
        }
    }

    fn rules() -> CompartmentRuleset {
        CompartmentRuleset::new([
            ("Observation", vec!["subject", "performer"]),
            ("Encounter", vec!["subject", "participant.individual"]),
        ])
    }

    #[test]
    fn test_member_included() {
        let (m, r, s) = (membership(), rules(), ServerBase::new("https://fhir.example.org"));
        let engine = CompartmentEngine::new(&m, &r, &s);
        let patient = doc(json!({"resourceType": "Patient", "id": "123"}));
        let practitioner = doc(json!({"resourceType": "Practitioner", "id": "d1"}));
        let other = doc(json!({"resourceType": "Patient", "id": "999"}));
        assert!(engine.includes(&patient, &BTreeSet::new()));
        assert!(engine.includes(&practitioner, &BTreeSet::new()));
        assert!(!engine.includes(&other, &BTreeSet::new()));
    }

    #[test]
    fn test_compartment_reference_included() {
        let (m, r, s) = (membership(), rules(), ServerBase::new("https://fhir.example.org"));
        let engine = CompartmentEngine::new(&m, &r, &s);

        let relative = doc(json!({"resourceType": "Observation", "id": "o1", "subject": {"reference": "Patient/123"}}));
        let absolute = doc(json!({
            "resourceType": "Observation",
            "id": "o2",
            "subject": {"reference": "https://fhir.example.org/Patient/123"}
        }));
        let nested = doc(json!({
            "resourceType": "Encounter",
            "id": "e1",
            "participant": [{"individual": {"reference": "Practitioner/x"}}, {"individual": {"reference": "Patient/123"}}]
        }));
        assert!(engine.includes(&relative, &BTreeSet::new()));
        assert!(engine.includes(&absolute, &BTreeSet::new()));
        assert!(engine.includes(&nested, &BTreeSet::new()));
    }

    #[test]
    fn test_external_reference_never_included() {
        let (m, r, s) = (membership(), rules(), ServerBase::new("https://fhir.example.org"));
        let engine = CompartmentEngine::new(&m, &r, &s);
        let external = doc(json!({
            "resourceType": "Observation",
            "id": "o3",
            "subject": {"reference": "https://other.example/Patient/123"}
        }));
        assert!(!engine.includes(&external, &BTreeSet::new()));
    }

    #[test]
    fn test_type_without_rules_or_unlisted_path() {
        let (m, r, s) = (membership(), rules(), ServerBase::relative_only());
        let engine = CompartmentEngine::new(&m, &r, &s);
        let condition = doc(json!({"resourceType": "Condition", "id": "c1", "subject": {"reference": "Patient/123"}}));
        let obs = doc(json!({"resourceType": "Observation", "id": "o4", "focus": {"reference": "Patient/123"}}));
        assert!(!engine.includes(&condition, &BTreeSet::new()));
        assert!(!engine.includes(&obs, &BTreeSet::new()));
    }

    #[test]
    fn test_reference_to_non_patient_member_does_not_anchor() {
        let (m, r, s) = (membership(), rules(), ServerBase::relative_only());
        let engine = CompartmentEngine::new(&m, &r, &s);
        let obs = doc(json!({"resourceType": "Observation", "id": "o5", "performer": [{"reference": "Practitioner/d1"}]}));
        assert!(!engine.includes(&obs, &BTreeSet::new()));
    }

    #[test]
    fn test_extra_keys() {
        let (m, r, s) = (membership(), rules(), ServerBase::relative_only());
        let engine = CompartmentEngine::new(&m, &r, &s);
        let org = doc(json!({"resourceType": "Organization", "id": "org1"}));
        let extra: BTreeSet<_> = [ResourceKey::new("Organization", "org1")].into_iter().collect();
        assert!(!engine.includes(&org, &BTreeSet::new()));
        assert!(engine.includes(&org, &extra));
        assert_eq!(engine.select(&[org], &extra).len(), 1);
    }

    #[test]
    fn test_ruleset_from_json() {
        let rules = CompartmentRuleset::from_json(br#"{"Observation": ["subject"], "Account": ["subject"]}"#).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.paths("Observation").unwrap(), &["subject".to_string()]);
        assert!(rules.paths("Patient").is_none());

        assert!(CompartmentRuleset::from_json(b"[1, 2]").unwrap_err().is_config());
    }
}
