//! Loading the group-export rulesets from the configuration bucket.

use tracing::info;

use crate::compartment::CompartmentRuleset;
use crate::config::FhirVersion;
use crate::error::{ConfigError, ExportResult};
use crate::store::ObjectStoreApi;
use crate::transitive::TransitiveRuleset;

/// Default key of the transitive ruleset.
pub const DEFAULT_TRANSITIVE_RULESET_KEY: &str = "transitiveReferenceParams.json";

/// Default key of the compartment ruleset for a FHIR version.
pub fn default_compartment_ruleset_key(version: FhirVersion) -> &'static str {
    match version {
        FhirVersion::Stu3 => "patientCompartmentSearchParams.3.0.2.json",
        FhirVersion::R4 => "patientCompartmentSearchParams.4.0.1.json",
    }
}

/// Both rulesets of a group export.
#[derive(Debug, Clone, Default)]
pub struct Rulesets {
    /// Compartment inclusion rules.
    pub compartment: CompartmentRuleset,
    /// Transitive extraction rules.
    pub transitive: TransitiveRuleset,
}

impl Rulesets {
    /// Loads both rulesets from `bucket`.
    pub async fn load(
        client: &dyn ObjectStoreApi,
        bucket: &str,
        compartment_key: &str,
        transitive_key: &str,
    ) -> ExportResult<Self> {
        let compartment = CompartmentRuleset::from_json(
            &fetch(client, bucket, compartment_key, "compartment").await?,
        )?;
        let transitive =
            TransitiveRuleset::from_json(&fetch(client, bucket, transitive_key, "transitive").await?)?;
        info!(
            bucket,
            compartment_key,
            transitive_key,
            compartment_types = compartment.len(),
            "Loaded group export rulesets"
        );
        Ok(Self {
            compartment,
            transitive,
        })
    }
}

async fn fetch(client: &dyn ObjectStoreApi, bucket: &str, key: &str, name: &str) -> ExportResult<Vec<u8>> {
    client.get_object(bucket, key).await?.ok_or_else(|| {
        ConfigError::InvalidRuleset {
            name: name.to_string(),
            message: format!("{bucket}/{key} does not exist"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    #[tokio::test]
    async fn test_load_rulesets() {
        let store = MemoryObjectStore::new();
        store.insert(
            "config",
            default_compartment_ruleset_key(FhirVersion::R4),
            r#"{"Observation": ["subject", "performer"]}"#,
        );
        store.insert(
            "config",
            DEFAULT_TRANSITIVE_RULESET_KEY,
            r#"{"Observation": {"performer": "Practitioner"}}"#,
        );

        let rulesets = Rulesets::load(
            &store,
            "config",
            default_compartment_ruleset_key(FhirVersion::R4),
            DEFAULT_TRANSITIVE_RULESET_KEY,
        )
        .await
        .unwrap();
        assert_eq!(rulesets.compartment.paths("Observation").map(<[String]>::len), Some(2));
        assert!(rulesets.transitive.rules("Observation").is_some());
    }

    #[tokio::test]
    async fn test_missing_ruleset_is_config_error() {
        let store = MemoryObjectStore::new();
        let err = Rulesets::load(&store, "config", "missing.json", DEFAULT_TRANSITIVE_RULESET_KEY)
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_default_keys() {
        assert_eq!(
            default_compartment_ruleset_key(FhirVersion::Stu3),
            "patientCompartmentSearchParams.3.0.2.json"
        );
    }
}
