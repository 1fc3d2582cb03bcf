//! Transitive reference closure.
//!
//! After the first inclusion pass, references found at the transitive paths of
//! each included document are collected and inclusion is re-run once with
//! those targets as extra seeds. The closure is exactly one extra hop: targets
//! discovered in the second pass are not followed.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compartment::CompartmentEngine;
use crate::document::Document;
use crate::error::{ConfigError, ExportResult};
use crate::reference::{ResourceKey, ServerBase, references_at};

/// Paths, per resource type, whose references pull further documents into an
/// export, each with the resource type it is expected to point at.
///
/// Stored as JSON: `{"Observation": {"performer": "Practitioner"}, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitiveRuleset(BTreeMap<String, BTreeMap<String, String>>);

impl TransitiveRuleset {
    /// Creates a ruleset from `(resource type, [(path, target type)])` entries.
    pub fn new<I, T, E, P, G>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, E)>,
        T: Into<String>,
        E: IntoIterator<Item = (P, G)>,
        P: Into<String>,
        G: Into<String>,
    {
        Self(
            entries
                .into_iter()
                .map(|(t, paths)| {
                    (
                        t.into(),
                        paths.into_iter().map(|(p, g)| (p.into(), g.into())).collect(),
                    )
                })
                .collect(),
        )
    }

    /// Parses the ruleset document.
    pub fn from_json(bytes: &[u8]) -> ExportResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            ConfigError::InvalidRuleset {
                name: "transitive".to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Returns the `path -> target type` rules for a resource type.
    pub fn rules(&self, resource_type: &str) -> Option<&BTreeMap<String, String>> {
        self.0.get(resource_type)
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Extracts the internal transitive targets of one document.
///
/// A reference is kept only if it is internal and its type is the configured
/// target type for the path.
pub fn transitive_targets(
    document: &Document,
    rules: &TransitiveRuleset,
    server: &ServerBase,
) -> BTreeSet<ResourceKey> {
    let Some(paths) = rules.rules(document.resource_type()) else {
        return BTreeSet::new();
    };
    paths
        .iter()
        .flat_map(|(path, target_type)| {
            references_at(document.as_map(), path)
                .into_iter()
                .filter_map(|reference| server.internal_target(reference))
                .filter(move |target| target.resource_type == *target_type)
        })
        .collect()
}

/// Extracts the transitive targets of every document in `included`.
pub fn collect_targets(
    included: &[Document],
    rules: &TransitiveRuleset,
    server: &ServerBase,
) -> BTreeSet<ResourceKey> {
    included
        .par_iter()
        .map(|document| transitive_targets(document, rules, server))
        .reduce(BTreeSet::new, |mut acc, set| {
            acc.extend(set);
            acc
        })
}

/// The two states of the closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosurePass {
    /// Inclusion from members and compartment references only.
    First,
    /// Inclusion re-run with the transitive targets of the first pass.
    Second,
}

/// Result of the closure.
#[derive(Debug, Clone)]
pub struct Closure {
    /// The included documents.
    pub documents: Vec<Document>,
    /// Extra keys seeded into the last pass; empty if only one pass ran.
    pub transitive_keys: BTreeSet<ResourceKey>,
    /// The last pass that ran.
    pub last_pass: ClosurePass,
}

/// Runs inclusion, then re-runs it once if the first pass yielded transitive
/// targets. The second pass replaces the first pass's result.
pub fn run_closure(
    documents: &[Document],
    engine: &CompartmentEngine<'_>,
    rules: &TransitiveRuleset,
    server: &ServerBase,
) -> Closure {
    let mut pass = ClosurePass::First;
    let mut extra = BTreeSet::new();
    loop {
        let included = engine.select(documents, &extra);
        info!(pass = ?pass, included = included.len(), "Completed inclusion pass");

        match pass {
            ClosurePass::First => {
                let targets = collect_targets(&included, rules, server);
                if targets.is_empty() {
                    return Closure {
                        documents: included,
                        transitive_keys: extra,
                        last_pass: pass,
                    };
                }
                info!(targets = targets.len(), "Following transitive references");
                extra = targets;
                pass = ClosurePass::Second;
            }
            ClosurePass::Second => {
                return Closure {
                    documents: included,
                    transitive_keys: extra,
                    last_pass: pass,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentRuleset;
    use crate::group::GroupMembership;
    use serde_json::{Value, json};

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn ids(docs: &[Document]) -> Vec<String> {
        let mut ids: Vec<String> = docs.iter().map(|d| format!("{}/{}", d.resource_type(), d.id())).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_targets_respect_type_and_internality() {
        let rules = TransitiveRuleset::new([("Observation", [("performer", "Practitioner")])]);
        let server = ServerBase::new("https://fhir.example.org");
        let obs = doc(json!({
            "resourceType": "Observation",
            "id": "o1",
            "performer": [
                {"reference": "Practitioner/a"},
                {"reference": "https://fhir.example.org/Practitioner/b"},
                {"reference": "https://other.example/Practitioner/c"},
                {"reference": "Organization/d"}
            ]
        }));
        let targets = transitive_targets(&obs, &rules, &server);
        assert_eq!(
            targets.into_iter().collect::<Vec<_>>(),
            vec![ResourceKey::new("Practitioner", "a"), ResourceKey::new("Practitioner", "b")]
        );
    }

    #[test]
    fn test_exactly_two_hops() {
        // A (member) -> B -> C
        let docs = vec![
            doc(json!({"resourceType": "Patient", "id": "A", "generalPractitioner": [{"reference": "Practitioner/B"}]})),
            doc(json!({"resourceType": "Practitioner", "id": "B", "managingOrganization": {"reference": "Organization/C"}})),
            doc(json!({"resourceType": "Organization", "id": "C"})),
        ];
        let a = ResourceKey::new("Patient", "A");
        let membership = GroupMembership {
            members: [a.clone()].into_iter().collect(),
            patients: [a].into_iter().collect(),
        };
        let compartment = CompartmentRuleset::default();
        let server = ServerBase::relative_only();
        let rules = TransitiveRuleset::new([
            ("Patient", vec![("generalPractitioner", "Practitioner")]),
            ("Practitioner", vec![("managingOrganization", "Organization")]),
        ]);
        let engine = CompartmentEngine::new(&membership, &compartment, &server);

        let closure = run_closure(&docs, &engine, &rules, &server);
        assert_eq!(closure.last_pass, ClosurePass::Second);
        assert_eq!(ids(&closure.documents), vec!["Patient/A", "Practitioner/B"]);
    }

    #[test]
    fn test_single_pass_without_targets() {
        let docs = vec![doc(json!({"resourceType": "Patient", "id": "A"}))];
        let a = ResourceKey::new("Patient", "A");
        let membership = GroupMembership {
            members: [a.clone()].into_iter().collect(),
            patients: [a].into_iter().collect(),
        };
        let compartment = CompartmentRuleset::default();
        let server = ServerBase::relative_only();
        let engine = CompartmentEngine::new(&membership, &compartment, &server);

        let closure = run_closure(&docs, &engine, &TransitiveRuleset::default(), &server);
        assert_eq!(closure.last_pass, ClosurePass::First);
        assert!(closure.transitive_keys.is_empty());
        assert_eq!(closure.documents.len(), 1);
    }

    #[test]
    fn test_ruleset_from_json() {
        let rules = TransitiveRuleset::from_json(br#"{"Encounter": {"serviceProvider": "Organization"}}"#).unwrap();
        assert_eq!(
            rules.rules("Encounter").unwrap().get("serviceProvider").map(String::as_str),
            Some("Organization")
        );
        assert!(TransitiveRuleset::from_json(br#"{"Encounter": ["x"]}"#).is_err());
    }
}
