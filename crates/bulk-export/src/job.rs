//! One export run, from parameters to renamed output objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use crate::config::{ExportJobConfig, ExportType};
use crate::error::{ConfigError, ExportResult};
use crate::output::{OutputLayout, ShardRenamer, ShardWriter};
use crate::pipeline::{ExportPlan, GroupScope};
use crate::rulesets::Rulesets;
use crate::snapshot::{ObjectStoreSnapshot, SnapshotSource};
use crate::store::ObjectStoreApi;

/// Result of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    /// The job id.
    pub job_id: String,
    /// Final keys of the output objects, in key order.
    pub output_keys: Vec<String>,
    /// Number of exported documents per resource type.
    pub resource_counts: BTreeMap<String, usize>,
}

impl ExportOutcome {
    /// Returns true if nothing was exported.
    pub fn is_empty(&self) -> bool {
        self.output_keys.is_empty()
    }

    /// Total number of exported documents.
    pub fn total(&self) -> usize {
        self.resource_counts.values().sum()
    }
}

/// Runs one export against an object store.
pub struct ExportJob {
    config: ExportJobConfig,
    store: Arc<dyn ObjectStoreApi>,
    snapshot: Arc<dyn SnapshotSource>,
}

impl ExportJob {
    /// Creates a job reading the snapshot from the configured bucket and prefix.
    pub fn new(config: ExportJobConfig, store: Arc<dyn ObjectStoreApi>) -> Self {
        let snapshot = Arc::new(ObjectStoreSnapshot::new(
            Arc::clone(&store),
            config.snapshot_bucket.clone(),
            config.snapshot_prefix.clone(),
        ));
        Self {
            config,
            store,
            snapshot,
        }
    }

    /// Replaces the snapshot source.
    pub fn with_snapshot(mut self, snapshot: Arc<dyn SnapshotSource>) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Returns the job configuration.
    pub fn config(&self) -> &ExportJobConfig {
        &self.config
    }

    /// Runs the export.
    ///
    /// Configuration problems are reported before anything is read. When no
    /// document survives filtering, no object is written.
    #[instrument(skip(self), fields(job_id = %self.config.job_id, export_type = %self.config.export_type))]
    pub async fn run(&self) -> ExportResult<ExportOutcome> {
        self.config.ensure_valid()?;
        let options = self.config.scan_options()?;
        let plan = self.plan().await?;

        let snapshot = self.snapshot.scan(&options).await?;
        let selected = plan.select(snapshot)?;

        let mut outcome = ExportOutcome {
            job_id: self.config.job_id.clone(),
            ..ExportOutcome::default()
        };
        if selected.is_empty() {
            info!("No resources within requested parameters to export");
            return Ok(outcome);
        }

        let layout = OutputLayout::new(self.config.job_id.clone(), self.config.tenant());
        let writer = ShardWriter::new(
            Arc::clone(&self.store),
            self.config.output_bucket.clone(),
            layout.clone(),
        );
        let shards = writer.write(&selected, Utc::now().timestamp_millis()).await?;
        for shard in &shards {
            *outcome
                .resource_counts
                .entry(shard.resource_type.clone())
                .or_default() += shard.count;
        }

        let renamer = ShardRenamer::new(
            Arc::clone(&self.store),
            self.config.output_bucket.clone(),
            layout,
            self.config.job_owner_id.as_deref(),
        )?;
        let shard_keys: Vec<String> = shards.into_iter().map(|shard| shard.key).collect();
        outcome.output_keys = renamer
            .rename(&shard_keys)
            .await?
            .into_iter()
            .map(|renamed| renamed.key)
            .collect();
        outcome.output_keys.sort();

        info!(
            objects = outcome.output_keys.len(),
            resources = outcome.total(),
            "Export completed"
        );
        Ok(outcome)
    }

    async fn plan(&self) -> ExportResult<ExportPlan> {
        let window = self.config.window()?;
        let plan = match self.config.export_type {
            ExportType::System => ExportPlan::system(window),
            ExportType::Group => ExportPlan::group(window, self.group_scope().await?),
        };
        Ok(plan.with_tenant(self.config.tenant()))
    }

    async fn group_scope(&self) -> ExportResult<GroupScope> {
        let group_id = required(self.config.group_id.as_deref(), "groupId")?;
        let config_bucket = required(self.config.config_bucket.as_deref(), "configBucket")?;
        let rulesets = Rulesets::load(
            self.store.as_ref(),
            config_bucket,
            self.config.compartment_ruleset_key(),
            &self.config.transitive_ruleset_key,
        )
        .await?;

        Ok(GroupScope::new(
            group_id,
            self.config.server_base(),
            rulesets.compartment,
            rulesets.transitive,
        )
        .with_version_ordering(self.config.group_version_ordering)
        .with_subject_type(self.config.subject_type.clone()))
    }
}

fn required<'a>(value: Option<&'a str>, parameter: &str) -> Result<&'a str, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingParameter {
            parameter: parameter.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshot;
    use crate::store::MemoryObjectStore;
    use serde_json::json;

    fn snapshot() -> Arc<MemorySnapshot> {
        Arc::new(MemorySnapshot::from_values([
            json!({
                "resourceType": "Patient",
                "id": "p1",
                "documentStatus": "AVAILABLE",
                "meta": {"lastUpdated": "2024-01-15T00:00:00.000Z", "versionId": "1"}
            }),
            json!({
                "resourceType": "Patient",
                "id": "p2",
                "documentStatus": "PENDING",
                "meta": {"lastUpdated": "2024-01-15T00:00:00.000Z", "versionId": "1"}
            }),
        ]))
    }

    #[tokio::test]
    async fn test_system_export_writes_and_renames() {
        let store = MemoryObjectStore::new();
        let job = ExportJob::new(
            ExportJobConfig {
                job_owner_id: Some("owner-1".to_string()),
                ..ExportJobConfig::for_testing()
            },
            Arc::new(store.clone()),
        )
        .with_snapshot(snapshot());

        let outcome = job.run().await.unwrap();
        assert_eq!(outcome.output_keys, vec!["test-job/Patient-00000.ndjson"]);
        assert_eq!(outcome.resource_counts.get("Patient"), Some(&1));
        assert_eq!(store.keys("output"), outcome.output_keys);
    }

    #[tokio::test]
    async fn test_invalid_config_reads_nothing() {
        let store = MemoryObjectStore::new();
        let job = ExportJob::new(
            ExportJobConfig {
                worker_type: "G.4X".to_string(),
                ..ExportJobConfig::for_testing()
            },
            Arc::new(store.clone()),
        )
        .with_snapshot(snapshot());

        let err = job.run().await.unwrap_err();
        assert!(err.is_config());
        assert!(store.keys("output").is_empty());
    }

    #[tokio::test]
    async fn test_outcome_serializes_camel_case() {
        let outcome = ExportOutcome {
            job_id: "j".to_string(),
            output_keys: vec!["j/Patient-00000.ndjson".to_string()],
            resource_counts: BTreeMap::from([("Patient".to_string(), 2)]),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["jobId"], "j");
        assert_eq!(value["resourceCounts"]["Patient"], 2);
        assert_eq!(outcome.total(), 2);
    }
}
