//! Object-store client interface.
//!
//! The export reads rulesets and snapshot objects through [`ObjectStoreApi`]
//! and writes, copies and deletes output objects through it. Retry and backoff
//! belong to the implementation (the AWS SDK retries on its own); callers
//! attempt every operation once.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ObjectStoreError;

mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use memory::{MemoryObjectStore, StoredObject};
#[cfg(feature = "s3")]
pub use s3::AwsS3Client;

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectItem {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: i64,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsResult {
    /// Objects on this page, in key order.
    pub items: Vec<ListObjectItem>,
    /// Token for the next page, if any.
    pub next_continuation_token: Option<String>,
}

/// Operations the export needs from an object store.
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// Lists one page of objects under `prefix`.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListObjectsResult, ObjectStoreError>;

    /// Reads an object. Returns `None` if it does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    /// Writes an object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), ObjectStoreError>;

    /// Copies an object within a bucket, replacing its content type and
    /// user metadata wholesale.
    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        destination_key: &str,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ObjectStoreError>;

    /// Deletes an object. Deleting a missing object succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}

/// Builds the `CopySource` value for a copy within `bucket`.
///
/// Each key segment is percent-encoded; the `/` separators are kept.
pub fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
    format!("{}/{}", bucket, encoded.join("/"))
}

/// Lists every object under `prefix`, following continuation tokens.
pub async fn list_objects_all(
    client: &dyn ObjectStoreApi,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<ListObjectItem>, ObjectStoreError> {
    let mut items = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = client
            .list_objects(bucket, prefix, continuation.as_deref())
            .await?;
        items.extend(page.items);
        match page.next_continuation_token {
            Some(token) => continuation = Some(token),
            None => return Ok(items),
        }
    }
}
