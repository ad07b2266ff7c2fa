use super::{BlobStore, StoreError};
use crate::config::S3Config;
use crate::photo::{BlobRef, ContentType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

/// Image bytes in an S3 (or S3-compatible) bucket
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

fn s3_error(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{context}: {e}"))
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        // Fail fast on a missing bucket or bad credentials
        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .with_context(|| format!("Bucket {} is not reachable", config.bucket))?;

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Single-part upload for small files
    async fn simple_upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: ContentType,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type.mime())
            .send()
            .await
            .map_err(|e| s3_error("Failed to upload photo", e))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: ContentType,
    ) -> Result<(), StoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type.mime())
            .send()
            .await
            .map_err(|e| s3_error("Failed to create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StoreError::Backend("No upload ID in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Don't leave half-uploaded parts billed in the bucket
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, data: Bytes) -> Result<(), StoreError> {
        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);
        let mut part_number = 1;
        let mut offset = 0;

        while offset < data.len() {
            let end = (offset + part_size).min(data.len());
            let body = ByteStream::from(data.slice(offset..end));

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| s3_error("Failed to upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
            offset = end;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| s3_error("Failed to complete multipart upload", e))?;

        Ok(())
    }

    /// Generate a presigned GET URL for a key
    async fn presigned_url(&self, key: &str) -> Result<String, StoreError> {
        let presigning_config = PresigningConfig::expires_in(self.config.presigned_url_expiry())
            .map_err(|e| s3_error("Failed to create presigning config", e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| s3_error("Failed to generate presigned URL", e))?;

        Ok(presigned.uri().to_string())
    }
}

/// URL of a key under a public base URL
fn public_object_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: ContentType,
    ) -> Result<BlobRef, StoreError> {
        let size = data.len();
        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(path, data, content_type).await?;
        } else {
            self.simple_upload(path, data, content_type).await?;
        }

        debug!(key = %path, size_bytes = size, "Photo uploaded");
        Ok(BlobRef::new(path))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Option<Bytes>, StoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(blob.as_str())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(s3_error("Failed to fetch photo", e));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| s3_error("Failed to read photo body", e))?;
        Ok(Some(body.into_bytes()))
    }

    #[instrument(skip(self), fields(key = %blob))]
    async fn delete(&self, blob: &BlobRef) -> Result<(), StoreError> {
        // S3 deletes are idempotent; a missing key succeeds
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(blob.as_str())
            .send()
            .await
            .map_err(|e| s3_error("Failed to delete photo", e))?;

        debug!("Photo deleted from S3");
        Ok(())
    }

    async fn public_url(&self, blob: &BlobRef) -> Result<String, StoreError> {
        match self.config.public_base_url {
            Some(ref base) => Ok(public_object_url(base, blob.as_str())),
            None => self.presigned_url(blob.as_str()).await,
        }
    }
}
