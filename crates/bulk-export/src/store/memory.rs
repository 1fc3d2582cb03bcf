use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ListObjectItem, ListObjectsResult, ObjectStoreApi};
use crate::error::ObjectStoreError;

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredObject {
    /// Object body.
    pub body: Vec<u8>,
    /// Content type, if one was set.
    pub content_type: Option<String>,
    /// User metadata.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<(String, String), StoredObject>,
    fail_deletes: bool,
}

/// An in-process object store.
///
/// Clones share state. Listings are returned in key order, paged by
/// `page_size`.
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<MemoryState>>,
    page_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            page_size: 1000,
        }
    }

    /// Sets the listing page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Makes every subsequent delete fail, leaving objects in place.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.state().fail_deletes = fail;
    }

    /// Stores an object directly.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.state().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                ..StoredObject::default()
            },
        );
    }

    /// Returns the keys in a bucket, in order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Returns a copy of a stored object.
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStoreApi for MemoryObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListObjectsResult, ObjectStoreError> {
        let state = self.state();
        let mut matching = state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|((_, k), _)| continuation.is_none_or(|after| k.as_str() > after))
            .map(|((_, k), object)| ListObjectItem {
                key: k.clone(),
                size: object.body.len() as i64,
            });

        let items: Vec<ListObjectItem> = matching.by_ref().take(self.page_size).collect();
        let next_continuation_token = match matching.next() {
            Some(_) => items.last().map(|item| item.key.clone()),
            None => None,
        };
        Ok(ListObjectsResult {
            items,
            next_continuation_token,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        Ok(self.object(bucket, key).map(|object| object.body))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        self.state().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.map(str::to_string),
                metadata: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        destination_key: &str,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ObjectStoreError> {
        let mut state = self.state();
        let source = state
            .objects
            .get(&(bucket.to_string(), source_key.to_string()))
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: source_key.to_string(),
            })?;
        let copied = StoredObject {
            body: source.body.clone(),
            content_type: Some(content_type.to_string()),
            metadata: metadata.clone(),
        };
        state
            .objects
            .insert((bucket.to_string(), destination_key.to_string()), copied);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let mut state = self.state();
        if state.fail_deletes {
            return Err(ObjectStoreError::Unavailable(format!(
                "delete disabled for {bucket}/{key}"
            )));
        }
        state.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_replaces_metadata() {
        let store = MemoryObjectStore::new();
        store
            .put_object("b", "src", b"line\n".to_vec(), Some("text/plain"))
            .await
            .unwrap();

        let metadata = BTreeMap::from([("job-owner-id".to_string(), "owner-1".to_string())]);
        store
            .copy_object("b", "src", "dst", "application/fhir+ndjson", &metadata)
            .await
            .unwrap();

        let copied = store.object("b", "dst").unwrap();
        assert_eq!(copied.body, b"line\n");
        assert_eq!(copied.content_type.as_deref(), Some("application/fhir+ndjson"));
        assert_eq!(copied.metadata, metadata);
        assert!(store.object("b", "src").is_some());
    }

    #[tokio::test]
    async fn test_copy_missing_source() {
        let store = MemoryObjectStore::new();
        let err = store
            .copy_object("b", "nope", "dst", "text/plain", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_and_delete() {
        let store = MemoryObjectStore::new();
        store.insert("b", "k", "body");
        assert_eq!(store.get_object("b", "k").await.unwrap(), Some(b"body".to_vec()));
        store.delete_object("b", "k").await.unwrap();
        assert_eq!(store.get_object("b", "k").await.unwrap(), None);
        store.delete_object("b", "k").await.unwrap();
    }

    #[tokio::test]
    async fn test_paging() {
        let store = MemoryObjectStore::new().with_page_size(2);
        for key in ["p/a", "p/b", "p/c"] {
            store.insert("b", key, "");
        }
        let first = store.list_objects("b", "p/", None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.next_continuation_token.unwrap();
        let second = store.list_objects("b", "p/", Some(&token)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].key, "p/c");
        assert!(second.next_continuation_token.is_none());
    }
}
