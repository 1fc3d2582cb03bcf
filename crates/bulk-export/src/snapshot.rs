//! Snapshot sources.
//!
//! A snapshot source supplies the full bulk read of the document store that
//! the filter pipeline runs over. The read is parameterized by the worker
//! shape of the job: the number of splits it would be divided into, and the
//! fraction of the source's read throughput the export may consume.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::document::Document;
use crate::error::{ConfigError, ExportResult, ObjectStoreError, ParseError};
use crate::store::{ObjectStoreApi, list_objects_all};

/// Default fraction of source read throughput an export may use.
pub const DEFAULT_READ_THROUGHPUT_PERCENT: f64 = 0.5;

/// Worker sizes an export job may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerType {
    /// Standard worker, 8 read slots.
    G1X,
    /// Large worker, 16 read slots.
    G2X,
}

impl WorkerType {
    /// Number of read slots per worker.
    pub fn slots(&self) -> u32 {
        match self {
            Self::G1X => 8,
            Self::G2X => 16,
        }
    }
}

impl FromStr for WorkerType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "G.1X" => Ok(Self::G1X),
            "G.2X" => Ok(Self::G2X),
            other => Err(ConfigError::UnsupportedWorkerType {
                worker_type: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::G1X => write!(f, "G.1X"),
            Self::G2X => write!(f, "G.2X"),
        }
    }
}

/// Parallelism hints for a snapshot read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanOptions {
    /// Number of splits the read is divided into.
    pub splits: u32,
    /// Fraction of the source's read throughput the scan may use.
    pub read_throughput_percent: f64,
}

impl ScanOptions {
    /// Derives the scan options from the worker shape.
    ///
    /// One worker is the driver, so `splits = (number_workers - 1) * slots`.
    pub fn from_worker_shape(
        worker_type: &str,
        number_workers: u32,
        read_throughput_percent: f64,
    ) -> Result<Self, ConfigError> {
        let worker_type: WorkerType = worker_type.parse()?;
        let splits = number_workers
            .checked_sub(1)
            .filter(|executors| *executors > 0)
            .and_then(|executors| executors.checked_mul(worker_type.slots()))
            .ok_or(ConfigError::InvalidWorkerCount { number_workers })?;
        Ok(Self {
            splits,
            read_throughput_percent,
        })
    }

    /// Number of source objects read at once.
    pub fn concurrency(&self) -> usize {
        let limit = (f64::from(self.splits) * self.read_throughput_percent).floor();
        if limit.is_finite() && limit >= 1.0 {
            limit as usize
        } else {
            1
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            splits: 8,
            read_throughput_percent: DEFAULT_READ_THROUGHPUT_PERCENT,
        }
    }
}

/// Supplies the documents of one snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Reads the whole snapshot.
    async fn scan(&self, options: &ScanOptions) -> ExportResult<Vec<Document>>;
}

/// A fixed set of documents.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    documents: Vec<Document>,
}

impl MemorySnapshot {
    /// Creates a snapshot from documents.
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    /// Creates a snapshot from JSON values, skipping non-objects.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self::new(values.into_iter().filter_map(Document::from_value).collect())
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshot {
    async fn scan(&self, _options: &ScanOptions) -> ExportResult<Vec<Document>> {
        Ok(self.documents.clone())
    }
}

/// A table export stored as NDJSON objects under a bucket prefix.
///
/// Objects are read concurrently, bounded by [`ScanOptions::concurrency`].
/// Documents are returned in key order, then line order.
#[derive(Clone)]
pub struct ObjectStoreSnapshot {
    client: Arc<dyn ObjectStoreApi>,
    bucket: String,
    prefix: String,
}

impl ObjectStoreSnapshot {
    /// Creates a source reading every object under `bucket/prefix`.
    pub fn new(client: Arc<dyn ObjectStoreApi>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

impl fmt::Debug for ObjectStoreSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreSnapshot")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SnapshotSource for ObjectStoreSnapshot {
    async fn scan(&self, options: &ScanOptions) -> ExportResult<Vec<Document>> {
        let keys: Vec<String> = list_objects_all(self.client.as_ref(), &self.bucket, &self.prefix)
            .await?
            .into_iter()
            .filter(|item| item.size > 0)
            .map(|item| item.key)
            .collect();
        let concurrency = options.concurrency();
        info!(
            bucket = %self.bucket,
            prefix = %self.prefix,
            objects = keys.len(),
            splits = options.splits,
            concurrency,
            "Reading snapshot"
        );

        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        for (index, key) in keys.into_iter().enumerate() {
            let client = Arc::clone(&self.client);
            let bucket = self.bucket.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;
                let body = client.get_object(&bucket, &key).await?.unwrap_or_default();
                let documents = parse_ndjson(&key, &body)?;
                debug!(key = %key, documents = documents.len(), "Read snapshot object");
                ExportResult::Ok((index, documents))
            });
        }

        let mut parts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let part = joined.map_err(|e| ObjectStoreError::Internal(format!("snapshot read task failed: {e}")))??;
            parts.push(part);
        }
        parts.sort_by_key(|(index, _)| *index);

        let documents: Vec<Document> = parts.into_iter().flat_map(|(_, docs)| docs).collect();
        info!(documents = documents.len(), "Finished reading snapshot");
        Ok(documents)
    }
}

/// Parses an NDJSON body. Blank lines are skipped; any other line must be a
/// JSON object.
pub fn parse_ndjson(key: &str, body: &[u8]) -> ExportResult<Vec<Document>> {
    let text = std::str::from_utf8(body).map_err(|e| ParseError::InvalidSnapshotLine {
        key: key.to_string(),
        line: 0,
        message: e.to_string(),
    })?;

    let mut documents = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let invalid = |message: String| ParseError::InvalidSnapshotLine {
            key: key.to_string(),
            line: number + 1,
            message,
        };
        let value: Value = serde_json::from_str(line).map_err(|e| invalid(e.to_string()))?;
        let document =
            Document::from_value(value).ok_or_else(|| invalid("not a JSON object".to_string()))?;
        documents.push(document);
    }
    Ok(documents)
}
