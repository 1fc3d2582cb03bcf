//! Output partitioning and the rename protocol.
//!
//! Projected documents are written as one NDJSON shard per resource type
//! under an engine-style partition path:
//!
//! ```text
//! {tenantId/}{jobId}/resourceTypeDup={type}/run-{epoch millis:13}-part-r-{index:05}
//! ```
//!
//! Each shard is then copied to its final name,
//! `{tenantId/}{jobId}/{type}-{index}.ndjson`, with the NDJSON content type and
//! fresh user metadata, and the shard is deleted. A crash between copy and
//! delete leaves the shard behind as a visible duplicate; the final object is
//! never partially written.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use crate::document::{Document, VersionOrdering};
use crate::error::{ExportResult, OutputError};
use crate::projection::PARTITION_KEY_FIELD;
use crate::store::ObjectStoreApi;
use crate::tenant::TenantId;

/// Media type of emitted objects.
pub const NDJSON_CONTENT_TYPE: &str = "application/fhir+ndjson";

/// User-metadata key carrying the requesting user.
pub const JOB_OWNER_METADATA_KEY: &str = "job-owner-id";

/// Captures `(resource type, shard index)` from a shard key.
pub const SHARD_KEY_PATTERN: &str = r"/resourceTypeDup=(\w+)/run-\d{13}-part-r-(\d{5})";

/// Key layout of one job's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    job_id: String,
    tenant: Option<TenantId>,
}

impl OutputLayout {
    /// Creates the layout for a job.
    pub fn new(job_id: impl Into<String>, tenant: Option<TenantId>) -> Self {
        Self {
            job_id: job_id.into(),
            tenant,
        }
    }

    /// Returns `{tenantId/}{jobId}/`.
    pub fn job_prefix(&self) -> String {
        match &self.tenant {
            Some(tenant) => format!("{}{}/", tenant.key_prefix(), self.job_id),
            None => format!("{}/", self.job_id),
        }
    }

    /// Returns the key of a freshly written shard.
    pub fn shard_key(&self, resource_type: &str, run_millis: i64, index: u32) -> String {
        format!(
            "{}{}={}/run-{:013}-part-r-{:05}",
            self.job_prefix(),
            PARTITION_KEY_FIELD,
            resource_type,
            run_millis,
            index
        )
    }

    /// Returns the final key of a renamed shard.
    pub fn final_key(&self, resource_type: &str, index: &str) -> String {
        format!("{}{}-{}.ndjson", self.job_prefix(), resource_type, index)
    }
}

/// A shard written by [`ShardWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenShard {
    /// Object key of the shard.
    pub key: String,
    /// Partition key of the shard.
    pub resource_type: String,
    /// Number of documents in the shard.
    pub count: usize,
}

/// Writes projected documents as one shard per resource type.
#[derive(Clone)]
pub struct ShardWriter {
    client: Arc<dyn ObjectStoreApi>,
    bucket: String,
    layout: OutputLayout,
}

impl ShardWriter {
    /// Creates a writer for `bucket`.
    pub fn new(client: Arc<dyn ObjectStoreApi>, bucket: impl Into<String>, layout: OutputLayout) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            layout,
        }
    }

    /// Writes the shards. Nothing is written for an empty input.
    ///
    /// Documents are partitioned by their partition-key attribute, which is
    /// removed from the emitted lines. Lines within a shard are ordered by
    /// `(id, version)`.
    pub async fn write(&self, documents: &[Document], run_millis: i64) -> ExportResult<Vec<WrittenShard>> {
        let mut written = Vec::new();
        for (resource_type, mut lines) in partition(documents) {
            lines.sort_by(|a, b| {
                a.id().cmp(b.id()).then_with(|| {
                    VersionOrdering::Numeric.compare(a.version_id().as_deref(), b.version_id().as_deref())
                })
            });
            let body = encode_ndjson(&lines)?;
            let key = self.layout.shard_key(&resource_type, run_millis, 0);
            self.client
                .put_object(&self.bucket, &key, body, Some(NDJSON_CONTENT_TYPE))
                .await?;
            debug!(key = %key, resource_type = %resource_type, count = lines.len(), "Wrote shard");
            written.push(WrittenShard {
                key,
                resource_type,
                count: lines.len(),
            });
        }
        info!(bucket = %self.bucket, shards = written.len(), "Finished writing shards");
        Ok(written)
    }
}

fn partition(documents: &[Document]) -> BTreeMap<String, Vec<Document>> {
    let mut partitions: BTreeMap<String, Vec<Document>> = BTreeMap::new();
    for document in documents {
        let resource_type = document
            .str_attr(PARTITION_KEY_FIELD)
            .unwrap_or_else(|| document.resource_type())
            .to_string();
        partitions
            .entry(resource_type)
            .or_default()
            .push(document.without_attrs(&[PARTITION_KEY_FIELD]));
    }
    partitions
}

fn encode_ndjson(documents: &[Document]) -> ExportResult<Vec<u8>> {
    let mut body = Vec::new();
    for document in documents {
        serde_json::to_writer(&mut body, document.as_map()).map_err(|e| OutputError::Serialization {
            message: e.to_string(),
        })?;
        body.push(b'\n');
    }
    Ok(body)
}

/// A shard renamed to its final key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedObject {
    /// Final object key.
    pub key: String,
    /// Resource type captured from the shard key.
    pub resource_type: String,
}

/// Applies the rename protocol to written shards.
#[derive(Clone)]
pub struct ShardRenamer {
    client: Arc<dyn ObjectStoreApi>,
    bucket: String,
    layout: OutputLayout,
    pattern: Regex,
    metadata: BTreeMap<String, String>,
}

impl ShardRenamer {
    /// Creates a renamer. The `job-owner-id` tag is attached when an owner
    /// is given.
    pub fn new(
        client: Arc<dyn ObjectStoreApi>,
        bucket: impl Into<String>,
        layout: OutputLayout,
        job_owner_id: Option<&str>,
    ) -> ExportResult<Self> {
        let pattern = Regex::new(SHARD_KEY_PATTERN).map_err(OutputError::from)?;
        let metadata = job_owner_id
            .map(|owner| (JOB_OWNER_METADATA_KEY.to_string(), owner.to_string()))
            .into_iter()
            .collect();
        Ok(Self {
            client,
            bucket: bucket.into(),
            layout,
            pattern,
            metadata,
        })
    }

    /// Captures `(resource type, shard index)` from a shard key.
    pub fn parse_shard_key(&self, key: &str) -> Option<(String, String)> {
        let captures = self.pattern.captures(key)?;
        Some((captures[1].to_string(), captures[2].to_string()))
    }

    /// Copies each shard to its final key, then deletes the shard.
    ///
    /// The copy always precedes the delete, so a failure leaves the shard in
    /// place.
    pub async fn rename(&self, shard_keys: &[String]) -> ExportResult<Vec<RenamedObject>> {
        let mut renamed = Vec::with_capacity(shard_keys.len());
        for shard_key in shard_keys {
            let (resource_type, index) = self
                .parse_shard_key(shard_key)
                .ok_or_else(|| OutputError::UnrecognizedShard { key: shard_key.clone() })?;
            let final_key = self.layout.final_key(&resource_type, &index);

            self.client
                .copy_object(&self.bucket, shard_key, &final_key, NDJSON_CONTENT_TYPE, &self.metadata)
                .await?;
            self.client.delete_object(&self.bucket, shard_key).await?;
            debug!(from = %shard_key, to = %final_key, "Renamed shard");

            renamed.push(RenamedObject {
                key: final_key,
                resource_type,
            });
        }
        info!(bucket = %self.bucket, objects = renamed.len(), "Finished renaming output");
        Ok(renamed)
    }
}
