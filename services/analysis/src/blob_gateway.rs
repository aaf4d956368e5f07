use crate::config::BlobConfig;
use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Object store holding uploaded photos.
///
/// `remove` is best-effort from the caller's point of view: the database is
/// authoritative, so callers log a failed removal and carry on.
#[async_trait]
pub trait BlobGateway: Send + Sync {
    /// Store bytes under `key` and return a publicly resolvable URL
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> ServiceResult<String>;

    /// Delete the object behind a URL returned by `put`, or behind a raw key
    async fn remove(&self, url_or_key: &str) -> ServiceResult<()>;
}

/// Build the object key for one uploaded photo.
///
/// Format: `{prefix}/{date}/{user}/{batch_no}/{index}_{uuid}.{ext}`
///
/// - date (YYYY-MM-DD) first, so lifecycle rules can target old uploads
/// - user next, for per-account listing and cleanup
/// - batch number groups the siblings of one upload
/// - index + uuid keep names unique and in upload order
pub fn object_key(
    prefix: &str,
    user_id: &str,
    batch_no: &str,
    index: usize,
    captured_at: DateTime<Utc>,
    mime_type: &str,
) -> String {
    let prefix = prefix.trim_matches('/');
    let path = format!(
        "{date}/{user}/{batch}/{index}_{id}.{ext}",
        date = captured_at.format("%Y-%m-%d"),
        user = sanitize_path_component(user_id),
        batch = sanitize_path_component(batch_no),
        index = index,
        id = Uuid::new_v4().simple(),
        ext = extension_for(mime_type),
    );

    if prefix.is_empty() {
        path
    } else {
        format!("{prefix}/{path}")
    }
}

/// S3-compatible blob gateway
pub struct S3BlobGateway {
    client: S3Client,
    bucket: String,
    public_base_url: String,
    config: BlobConfig,
}

impl S3BlobGateway {
    /// Create a new gateway
    pub async fn new(config: &BlobConfig) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/R2/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        let public_base_url = public_base_url(config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base_url = %public_base_url,
            "Blob gateway initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url,
            config: config.clone(),
        })
    }

    /// Public URL of an object key
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// Object key behind a URL or key reference
    pub fn key_for(&self, url_or_key: &str) -> String {
        key_from_reference(url_or_key, &self.public_base_url, &self.bucket)
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, bytes: Bytes, content_type: &str) -> ServiceResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                ServiceError::storage(format!(
                    "Failed to upload {key}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> ServiceResult<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                ServiceError::storage(format!(
                    "Failed to create multipart upload for {key}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| ServiceError::storage("No upload ID in response"))?
            .to_string();

        match self.upload_parts(key, &upload_id, bytes).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| {
                        ServiceError::storage(format!(
                            "Failed to complete multipart upload for {key}: {}",
                            DisplayErrorContext(&e)
                        ))
                    })?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: Bytes,
    ) -> ServiceResult<Vec<CompletedPart>> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut start = 0;

        while start < bytes.len() {
            let end = (start + part_size).min(bytes.len());

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes.slice(start..end)))
                .send()
                .await
                .map_err(|e| {
                    ServiceError::storage(format!(
                        "Failed to upload part {part_number} of {key}: {}",
                        DisplayErrorContext(&e)
                    ))
                })?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            start = end;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobGateway for S3BlobGateway {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> ServiceResult<String> {
        let size_bytes = bytes.len();

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, bytes, content_type).await?;
        } else {
            self.simple_upload(key, bytes, content_type).await?;
        }

        metrics::counter!("analysis.blobs.uploaded").increment(1);
        debug!(key = %key, size_bytes, "Photo uploaded");

        Ok(self.public_url(key))
    }

    #[instrument(skip(self))]
    async fn remove(&self, url_or_key: &str) -> ServiceResult<()> {
        let key = self.key_for(url_or_key);
        if key.is_empty() {
            return Err(ServiceError::validation(format!(
                "No object key in reference: {url_or_key}"
            )));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                ServiceError::storage(format!(
                    "Failed to delete {key}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(key = %key, "Photo deleted");
        Ok(())
    }
}

/// Base URL under which objects are publicly reachable
fn public_base_url(config: &BlobConfig) -> String {
    if let Some(ref base) = config.public_base_url {
        return base.trim_end_matches('/').to_string();
    }

    match config.endpoint_url {
        Some(ref endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        None => format!(
            "https://{}.s3.{}.amazonaws.com",
            config.bucket, config.region
        ),
    }
}

/// Strip a public URL down to its object key; raw keys pass through
fn key_from_reference(reference: &str, public_base_url: &str, bucket: &str) -> String {
    let reference = reference.trim();

    if let Some(key) = reference
        .strip_prefix(public_base_url)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        return key.to_string();
    }

    let path = match reference.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => reference,
    };
    // Drop any query string or fragment from URL references
    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = path.trim_start_matches('/');

    match path.strip_prefix(bucket).and_then(|rest| rest.strip_prefix('/')) {
        Some(key) if reference.contains("://") => key.to_string(),
        _ => path.to_string(),
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// File extension for an image mime type
pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/heic" => "heic",
        "image/heif" => "heif",
        "image/tiff" => "tiff",
        _ => "bin",
    }
}
