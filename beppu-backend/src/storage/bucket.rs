use crate::error::{AppError, Result};
use crate::storage::{ByteStream, StorageBackend};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::{RetryConfig, RetryMode};
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

/// Remote bucket backend over any S3-compatible endpoint.
#[derive(Clone)]
pub struct BucketStorage {
    client: Client,
    bucket: String,
}

impl BucketStorage {
    /// Connect to a bucket. `endpoint_url` selects an S3-compatible
    /// provider (MinIO and friends); absent means plain AWS.
    pub async fn new(bucket: String, region: String, endpoint_url: Option<String>) -> Result<Self> {
        let region_provider = RegionProviderChain::first_try(aws_config::Region::new(region));

        let retry_config = RetryConfig::standard()
            .with_max_attempts(3)
            .with_retry_mode(RetryMode::Adaptive);

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .retry_config(retry_config.clone())
            .load()
            .await;

        let client = if let Some(ref endpoint) = endpoint_url {
            // S3-compatible providers need path-style addressing
            let mut builder = aws_sdk_s3::Config::builder()
                .endpoint_url(endpoint)
                .region(config.region().cloned())
                .retry_config(retry_config)
                .force_path_style(true);
            if let Some(provider) = config.credentials_provider() {
                builder = builder.credentials_provider(provider);
            }
            Client::from_conf(builder.build())
        } else {
            Client::new(&config)
        };

        Ok(Self { client, bucket })
    }

    fn object_key(file_id: &str) -> String {
        format!("files/{}", file_id)
    }
}

#[async_trait]
impl StorageBackend for BucketStorage {
    fn storage_key_for(&self, file_id: &str) -> String {
        Self::object_key(file_id)
    }

    async fn save(&self, file_id: &str, data: &[u8]) -> Result<String> {
        let key = Self::object_key(file_id);
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(S3ByteStream::from(Bytes::copy_from_slice(data)))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = size,
                    "Bucket upload failed"
                );
                AppError::BackendWriteFailure(e.to_string())
            })?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            "Bucket upload successful"
        );

        Ok(key)
    }

    async fn read(&self, storage_key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(storage_key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err)
                    if matches!(service_err.err(), GetObjectError::NoSuchKey(_)) =>
                {
                    AppError::FileNotFound
                }
                _ => {
                    tracing::error!(
                        error = %e,
                        bucket = %self.bucket,
                        key = %storage_key,
                        "Bucket download failed"
                    );
                    AppError::ServerError(e.to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| AppError::ServerError(e.to_string()))?;

        Ok(data.into_bytes().to_vec())
    }

    async fn open_stream(&self, storage_key: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(storage_key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err)
                    if matches!(service_err.err(), GetObjectError::NoSuchKey(_)) =>
                {
                    AppError::FileNotFound
                }
                _ => AppError::ServerError(e.to_string()),
            })?;

        let reader = response.body.into_async_read();
        Ok(ReaderStream::new(reader).boxed())
    }

    async fn delete(&self, storage_key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(storage_key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %storage_key,
                    "Bucket delete failed"
                );
                AppError::ServerError(e.to_string())
            })?;

        tracing::debug!(bucket = %self.bucket, key = %storage_key, "Bucket delete successful");
        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(storage_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match &e {
                SdkError::ServiceError(service_err)
                    if matches!(service_err.err(), HeadObjectError::NotFound(_)) =>
                {
                    Ok(false)
                }
                _ => Err(AppError::ServerError(e.to_string())),
            },
        }
    }

    fn kind(&self) -> &'static str {
        "bucket"
    }
}
