//! SiteEye Analysis Service
//!
//! Photo analysis and record lifecycle service for the SiteEye construction
//! site inspection platform. Clients upload one or more site photos; each photo
//! is assessed by an external vision model for safety, hygiene and workmanship
//! problems, and for authenticated callers the photo and its assessment are
//! stored as an analysis record.
//!
//! ## Features
//!
//! - **Batch Uploads**: Every upload is grouped under one batch number, and a
//!   failing photo never aborts its siblings
//! - **Localized Assessments**: Inspection prompts in Traditional Chinese,
//!   Simplified Chinese, English and German
//! - **Record Lifecycle**: Soft delete into a trash, restore, and permanent
//!   purge of records together with their photos
//! - **Retention Sweeping**: Trashed records are purged automatically once the
//!   retention window has passed
//!
//! ## Architecture
//!
//! ```text
//! HTTP API                 Vision Model              S3 Bucket
//! ┌──────────────┐        ┌──────────────┐        ┌──────────────┐
//! │ Upload       │        │ chat/        │        │ analyses/    │
//! │ Lifecycle    │        │ completions  │        │   {date}/    │
//! │ Maintenance  │        └──────────────┘        │   {user}/    │
//! └──────────────┘               ▲                │   {batch}/   │
//!        │                       │                └──────────────┘
//!        ▼                       │                       ▲
//! ┌──────────────┐        ┌──────────────┐               │
//! │ Batch Upload │───────▶│ Analysis     │               │
//! │ Coordinator  │        │ Invoker      │               │
//! └──────────────┘        └──────────────┘               │
//!        │                                               │
//!        ├───────────────────────────────────────────────┤
//!        ▼                                               │
//! ┌──────────────┐        ┌──────────────┐        ┌──────────────┐
//! │ Record       │◀───────│ Lifecycle    │───────▶│ Blob         │
//! │ Store (PG)   │        │ Manager      │        │ Gateway      │
//! └──────────────┘        └──────────────┘        └──────────────┘
//!        ▲                       ▲
//!        │                ┌──────────────┐
//!        └────────────────│ Retention    │
//!                         │ Sweeper      │
//!                         └──────────────┘
//! ```

pub mod analysis_invoker;
pub mod api;
pub mod batch_coordinator;
pub mod blob_gateway;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod prompts;
pub mod record_store;
pub mod sweeper;

#[cfg(test)]
mod testing;

pub use analysis_invoker::{AnalysisError, AnalysisInvoker, OpenAiVision, VisionCapability};
pub use api::{create_router, start_api_server, AppState};
pub use batch_coordinator::{
    BatchOutcome, BatchUploadCoordinator, Identity, ImageOutcome, ImageResult, UploadedImage,
};
pub use blob_gateway::{BlobGateway, S3BlobGateway};
pub use config::Config;
pub use error::{ServiceError, ServiceResult};
pub use lifecycle::LifecycleManager;
pub use prompts::Locale;
pub use record_store::{AnalysisRecord, PgRecordStore, RecordState, RecordStore, User};
pub use sweeper::RetentionSweeper;
