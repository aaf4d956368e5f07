use crate::analysis_invoker::AnalysisInvoker;
use crate::blob_gateway::{object_key, BlobGateway};
use crate::config::BatchConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::prompts::Locale;
use crate::record_store::{ImageMetadata, NewRecord, RecordStore};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Caller identity forwarded by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable, opaque subject id
    pub user_id: String,
    /// Primary email, when the provider supplied one
    pub email: Option<String>,
}

/// One photo from an upload request
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Bytes,
    pub mime_type: String,
    pub filename: String,
}

/// What happened to one image of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ImageOutcome {
    /// Analyzed and persisted
    Saved { analysis_text: String, record_id: i64 },
    /// Analyzed but not persisted (anonymous caller, or storage/save failure)
    Unsaved {
        analysis_text: String,
        reason: Option<String>,
    },
    /// Not analyzed
    Failed { error: String, code: &'static str },
}

/// Per-image entry of a batch result, in upload order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResult {
    pub index: usize,
    pub filename: String,
    #[serde(flatten)]
    pub outcome: ImageOutcome,
}

/// Result of one upload action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// Shared by every record created by this upload
    pub batch_no: String,
    pub locale: Locale,
    pub results: Vec<ImageResult>,
}

impl BatchOutcome {
    /// Ids of the records persisted by this batch
    pub fn saved_record_ids(&self) -> Vec<i64> {
        self.results
            .iter()
            .filter_map(|r| match r.outcome {
                ImageOutcome::Saved { record_id, .. } => Some(record_id),
                _ => None,
            })
            .collect()
    }

    /// Number of images that could not be analyzed
    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ImageOutcome::Failed { .. }))
            .count()
    }
}

/// Generate a batch number: sortable millisecond timestamp plus 32 random bits,
/// so concurrent uploads within the same millisecond stay distinct
pub fn generate_batch_no() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        &random[..8]
    )
}

/// Email stored for callers whose identity carries none
fn placeholder_email(user_id: &str) -> String {
    format!("user_{user_id}@placeholder.invalid")
}

/// Where successful analyses of this batch go
enum Persistence<'a> {
    /// Unauthenticated caller; nothing is stored
    Anonymous,
    /// The owner row could not be ensured; nothing is stored
    Blocked(String),
    /// Store under this user
    Owner(&'a str),
}

/// Drives one multi-image upload: analyze each photo, store the photo and the
/// assessment for authenticated callers, and report per-image outcomes.
pub struct BatchUploadCoordinator {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobGateway>,
    invoker: Arc<AnalysisInvoker>,
    key_prefix: String,
    max_images: usize,
    concurrency: usize,
}

impl BatchUploadCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobGateway>,
        invoker: Arc<AnalysisInvoker>,
        config: &BatchConfig,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            blobs,
            invoker,
            key_prefix: key_prefix.into(),
            max_images: config.max_images,
            concurrency: config.concurrency.max(1),
        }
    }

    /// Process one upload.
    ///
    /// Only malformed requests fail as a whole; every per-image problem is
    /// reported in that image's entry and the remaining images still run.
    #[instrument(
        skip(self, identity, images),
        fields(
            user_id = identity.map(|i| i.user_id.as_str()).unwrap_or("anonymous"),
            image_count = images.len(),
            locale = %locale,
        )
    )]
    pub async fn process_batch(
        &self,
        identity: Option<&Identity>,
        images: Vec<UploadedImage>,
        locale: Locale,
    ) -> ServiceResult<BatchOutcome> {
        if images.is_empty() {
            return Err(ServiceError::validation("no images attached"));
        }
        if images.len() > self.max_images {
            return Err(ServiceError::validation(format!(
                "too many images: {} (max {})",
                images.len(),
                self.max_images
            )));
        }

        let batch_no = generate_batch_no();

        let persistence = match identity {
            None => Persistence::Anonymous,
            Some(identity) => match self.ensure_owner(identity).await {
                Ok(()) => Persistence::Owner(identity.user_id.as_str()),
                Err(e) => {
                    error!(error = %e, user_id = %identity.user_id, "Failed to ensure user row");
                    Persistence::Blocked(e.to_string())
                }
            },
        };

        let results: Vec<ImageResult> = stream::iter(images.into_iter().enumerate())
            .map(|(index, image)| {
                self.process_image(index, image, &persistence, &batch_no, locale)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let outcome = BatchOutcome {
            batch_no,
            locale,
            results,
        };

        info!(
            batch_no = %outcome.batch_no,
            saved = outcome.saved_record_ids().len(),
            failed = outcome.failed_count(),
            "Batch processed"
        );

        Ok(outcome)
    }

    /// Make sure the owner row exists before any record references it
    async fn ensure_owner(&self, identity: &Identity) -> ServiceResult<()> {
        match identity.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            Some(email) => {
                self.store.upsert_user(&identity.user_id, email).await?;
            }
            None => {
                if self.store.find_user(&identity.user_id).await?.is_none() {
                    let email = placeholder_email(&identity.user_id);
                    self.store.upsert_user(&identity.user_id, &email).await?;
                    info!(user_id = %identity.user_id, "Created placeholder user");
                }
            }
        }
        Ok(())
    }

    async fn process_image(
        &self,
        index: usize,
        image: UploadedImage,
        persistence: &Persistence<'_>,
        batch_no: &str,
        locale: Locale,
    ) -> ImageResult {
        let outcome = self
            .analyze_and_store(index, &image, persistence, batch_no, locale)
            .await;

        ImageResult {
            index,
            filename: image.filename,
            outcome,
        }
    }

    async fn analyze_and_store(
        &self,
        index: usize,
        image: &UploadedImage,
        persistence: &Persistence<'_>,
        batch_no: &str,
        locale: Locale,
    ) -> ImageOutcome {
        if !image.mime_type.to_ascii_lowercase().starts_with("image/") {
            metrics::counter!("analysis.images.failed").increment(1);
            let error = ServiceError::validation(format!("unsupported mime type: {}", image.mime_type));
            return ImageOutcome::Failed {
                code: error.code(),
                error: error.to_string(),
            };
        }

        let analysis_text = match self
            .invoker
            .analyze(&image.bytes, &image.mime_type, locale)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                metrics::counter!("analysis.images.failed").increment(1);
                warn!(index, filename = %image.filename, error = %e, "Image analysis failed");
                let error = ServiceError::from(e);
                return ImageOutcome::Failed {
                    code: error.code(),
                    error: error.to_string(),
                };
            }
        };
        metrics::counter!("analysis.images.analyzed").increment(1);

        let user_id = match persistence {
            Persistence::Anonymous => {
                return ImageOutcome::Unsaved {
                    analysis_text,
                    reason: None,
                }
            }
            Persistence::Blocked(reason) => {
                metrics::counter!("analysis.records.unsaved").increment(1);
                return ImageOutcome::Unsaved {
                    analysis_text,
                    reason: Some(reason.clone()),
                };
            }
            Persistence::Owner(user_id) => *user_id,
        };

        match self.persist(index, image, user_id, batch_no, &analysis_text).await {
            Ok(record_id) => {
                metrics::counter!("analysis.records.saved").increment(1);
                ImageOutcome::Saved {
                    analysis_text,
                    record_id,
                }
            }
            Err(e) => {
                metrics::counter!("analysis.records.unsaved").increment(1);
                error!(index, filename = %image.filename, error = %e, "Failed to persist analysis");
                ImageOutcome::Unsaved {
                    analysis_text,
                    reason: Some(e.to_string()),
                }
            }
        }
    }

    /// Store the photo, then the record. A photo whose record could not be
    /// saved is removed again (best effort).
    async fn persist(
        &self,
        index: usize,
        image: &UploadedImage,
        user_id: &str,
        batch_no: &str,
        analysis_text: &str,
    ) -> ServiceResult<i64> {
        let captured_at = Utc::now();
        let key = object_key(
            &self.key_prefix,
            user_id,
            batch_no,
            index,
            captured_at,
            &image.mime_type,
        );

        let image_url = self
            .blobs
            .put(&key, image.bytes.clone(), &image.mime_type)
            .await?;

        let record = NewRecord {
            user_id: user_id.to_string(),
            image_url,
            analysis_text: analysis_text.to_string(),
            metadata: ImageMetadata {
                original_filename: image.filename.clone(),
                mime_type: image.mime_type.clone(),
                size_bytes: image.bytes.len() as u64,
                storage_path: Some(key.clone()),
                captured_at,
            },
            batch_no: Some(batch_no.to_string()),
        };

        match self.store.save(record).await {
            Ok(saved) => Ok(saved.id),
            Err(e) => {
                if let Err(remove_err) = self.blobs.remove(&key).await {
                    metrics::counter!("analysis.blobs.remove_failed").increment(1);
                    warn!(key = %key, error = %remove_err, "Failed to remove orphaned photo");
                }
                Err(e)
            }
        }
    }
}
