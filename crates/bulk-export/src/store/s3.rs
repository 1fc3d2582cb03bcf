use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::MetadataDirective;

use super::{ListObjectItem, ListObjectsResult, ObjectStoreApi, copy_source};
use crate::error::ObjectStoreError;

/// [`ObjectStoreApi`] over Amazon S3.
#[derive(Debug, Clone)]
pub struct AwsS3Client {
    client: Client,
}

impl AwsS3Client {
    /// Creates a client from a loaded SDK configuration.
    pub fn from_sdk_config(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    /// Loads the SDK configuration from the environment.
    ///
    /// `endpoint_url` points the client at an S3-compatible service.
    pub async fn load_sdk_config(region: Option<&str>, endpoint_url: Option<&str>) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        if let Some(endpoint_url) = endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        loader.load().await
    }
}

#[async_trait]
impl ObjectStoreApi for AwsS3Client {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListObjectsResult, ObjectStoreError> {
        let mut req = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
        if let Some(token) = continuation {
            req = req.continuation_token(token);
        }

        let out = req
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, prefix))?;
        let items = out
            .contents()
            .iter()
            .filter_map(|item| {
                item.key().map(|key| ListObjectItem {
                    key: key.to_string(),
                    size: item.size().unwrap_or_default(),
                })
            })
            .collect();

        Ok(ListObjectsResult {
            items,
            next_continuation_token: out.next_continuation_token().map(|s| s.to_string()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(out) => {
                let bytes = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| {
                        ObjectStoreError::Internal(format!("failed to collect object body: {e}"))
                    })?
                    .into_bytes()
                    .to_vec();
                Ok(Some(bytes))
            }
            Err(err) => match map_sdk_error(err, bucket, key) {
                ObjectStoreError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body));
        if let Some(content_type) = content_type {
            req = req.content_type(content_type);
        }
        req.send().await.map_err(|e| map_sdk_error(e, bucket, key))?;
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
        let metadata: HashMap<String, String> = metadata.clone().into_iter().collect();
        self.client
            .copy_object()
            .bucket(bucket)
            .copy_source(copy_source(bucket, source_key))
            .key(destination_key)
            .content_type(content_type)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, source_key))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        Ok(())
    }
}

fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, bucket: &str, key: &str) -> ObjectStoreError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let fallback = format!("{err:?}");

    match err {
        aws_sdk_s3::error::SdkError::ServiceError(service_err) => {
            let code = service_err.err().code().unwrap_or("Unknown");
            let message = service_err
                .err()
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| fallback.clone());
            match code {
                "NoSuchKey" | "NotFound" | "NoSuchBucket" => ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                "PreconditionFailed" => ObjectStoreError::PreconditionFailed {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                "SlowDown" | "Throttling" | "ThrottlingException" => {
                    ObjectStoreError::Throttled(message)
                }
                "InvalidBucketName" | "InvalidArgument" | "InvalidRequest" => {
                    ObjectStoreError::InvalidInput(message)
                }
                _ => ObjectStoreError::Internal(message),
            }
        }
        aws_sdk_s3::error::SdkError::TimeoutError(_) => ObjectStoreError::Unavailable(fallback),
        aws_sdk_s3::error::SdkError::DispatchFailure(_) => ObjectStoreError::Unavailable(fallback),
        _ => ObjectStoreError::Internal(fallback),
    }
}
