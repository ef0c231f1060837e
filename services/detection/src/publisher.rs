use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors raised while publishing a result image
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("failed to build reference URL: {0}")]
    Reference(String),
}

/// Durable reference to a published result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedReference {
    pub url: String,
}

/// Remote store the orchestrator hands located results to.
///
/// Implementations leave the local file untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, file_path: &Path) -> Result<PublishedReference, PublishError>;
}

/// S3 publisher for result images
pub struct S3Publisher {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Publisher {
    /// Create a new S3 publisher. Credentials come from the default AWS
    /// provider chain and are resolved once here.
    pub async fn new(config: &S3Config) -> Self {
        let timeout = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.upload_timeout_secs))
            .build();

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(timeout)
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            folder = %config.folder,
            "S3 publisher initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    /// Build the object key for a result file.
    /// Format: {folder}/{date}/{uuid}.{ext}
    pub fn object_key(&self, file_path: &Path) -> String {
        object_key(&self.config.folder, file_path)
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(upload_error)?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), PublishError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(upload_error)?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| PublishError::Upload("no upload ID in response".to_string()))?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in data.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(upload_error)?;

            completed_parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
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
            .map_err(upload_error)?;

        Ok(())
    }

    /// Public URL when a base is configured, presigned GET otherwise
    async fn reference_url(&self, key: &str) -> Result<String, PublishError> {
        if let Some(ref base) = self.config.public_base_url {
            return Ok(format!("{}/{}", base.trim_end_matches('/'), key));
        }

        let presigning_config = PresigningConfig::expires_in(self.config.presigned_url_expiry())
            .map_err(|e| PublishError::Reference(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| PublishError::Reference(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    /// Check the bucket is reachable with the configured credentials
    pub async fn check_bucket(&self) -> Result<(), PublishError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(upload_error)?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for S3Publisher {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn publish(&self, file_path: &Path) -> Result<PublishedReference, PublishError> {
        let data = tokio::fs::read(file_path)
            .await
            .map_err(|source| PublishError::Read {
                path: file_path.to_path_buf(),
                source,
            })?;

        let key = self.object_key(file_path);
        let content_type = get_content_type(file_path);
        let size_bytes = data.len();

        debug!(key = %key, size_bytes, "Uploading result image to S3");

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(&key, &data, content_type).await?;
        } else {
            self.simple_upload(&key, data, content_type).await?;
        }

        let url = self.reference_url(&key).await?;

        info!(key = %key, size_bytes, "Result image published");

        Ok(PublishedReference { url })
    }
}

fn upload_error<E>(err: SdkError<E>) -> PublishError
where
    E: std::error::Error + 'static,
{
    PublishError::Upload(DisplayErrorContext(&err).to_string())
}

fn object_key(folder: &str, file_path: &Path) -> String {
    let date = Utc::now().format("%Y-%m-%d");
    let folder = folder.trim_matches('/');
    let id = Uuid::new_v4().simple();

    match file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
    {
        Some(ext) => format!("{folder}/{date}/{id}.{ext}"),
        None => format!("{folder}/{date}/{id}"),
    }
}

/// Get content type for a result image
fn get_content_type(file_path: &Path) -> &'static str {
    let ext = file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();

    match ext.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
