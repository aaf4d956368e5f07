use crate::config::DatabaseConfig;
use crate::error::{ServiceError, ServiceResult};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Account that owns analysis records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Identity provider subject
    pub id: String,
    /// Primary email address
    pub email: String,
    /// When the row was first created
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of an analysis record.
///
/// `Purged` is terminal: a purged record no longer exists in the store, so it
/// is only ever a transition target and never a stored or queryable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Visible in normal listings
    Active,
    /// Soft-deleted, restorable until purged
    Trash,
    /// Permanently removed
    Purged,
}

impl RecordState {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Active => "active",
            RecordState::Trash => "trash",
            RecordState::Purged => "purged",
        }
    }

    /// State a record must be in for a `set_state` into `self` to apply
    pub fn expected_prior(&self) -> Option<RecordState> {
        match self {
            RecordState::Active => Some(RecordState::Trash),
            RecordState::Trash => Some(RecordState::Active),
            RecordState::Purged => None,
        }
    }
}

impl TryFrom<&str> for RecordState {
    type Error = ServiceError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "active" => Ok(RecordState::Active),
            "trash" => Ok(RecordState::Trash),
            other => Err(ServiceError::validation(format!(
                "Unknown record state: {other}"
            ))),
        }
    }
}

/// Facts about the uploaded image, stored alongside the assessment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Filename as sent by the client
    #[serde(default)]
    pub original_filename: String,
    /// Mime type of the upload
    #[serde(default)]
    pub mime_type: String,
    /// Upload size in bytes
    #[serde(default)]
    pub size_bytes: u64,
    /// Object key in the blob store
    #[serde(default)]
    pub storage_path: Option<String>,
    /// When the photo was received
    pub captured_at: DateTime<Utc>,
}

/// Persisted photo assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: i64,
    pub user_id: String,
    pub image_url: String,
    pub analysis_text: String,
    pub metadata: ImageMetadata,
    pub batch_no: Option<String>,
    pub state: RecordState,
    /// Set iff `state` is `Trash`
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// Reference handed to the blob store when the record is purged
    pub fn blob_reference(&self) -> &str {
        self.metadata
            .storage_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.image_url)
    }
}

/// Input for [`RecordStore::save`]
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub user_id: String,
    pub image_url: String,
    pub analysis_text: String,
    pub metadata: ImageMetadata,
    /// Shared by siblings from one upload; `None` for single uploads
    pub batch_no: Option<String>,
}

impl NewRecord {
    /// Reject records missing an owner, image or assessment
    pub fn validate(&self) -> ServiceResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(ServiceError::validation("user id is required"));
        }
        if self.image_url.trim().is_empty() {
            return Err(ServiceError::validation("image url is required"));
        }
        if self.analysis_text.trim().is_empty() {
            return Err(ServiceError::validation("analysis text is required"));
        }
        Ok(())
    }
}

/// Check a `set_state` request and return the prior state it applies to
pub fn validate_transition(
    state: RecordState,
    deleted_at: Option<DateTime<Utc>>,
) -> ServiceResult<RecordState> {
    match (state, deleted_at) {
        (RecordState::Trash, None) => Err(ServiceError::validation(
            "moving to trash requires a deletion timestamp",
        )),
        (RecordState::Active, Some(_)) => Err(ServiceError::validation(
            "active records cannot carry a deletion timestamp",
        )),
        (RecordState::Purged, _) => Err(ServiceError::validation(
            "purged records are deleted, not updated",
        )),
        (state, _) => state
            .expected_prior()
            .ok_or_else(|| ServiceError::validation("invalid transition")),
    }
}

/// Reject listing states that are not stored
pub fn validate_listing(limit: i64, offset: i64, state: RecordState) -> ServiceResult<()> {
    if state == RecordState::Purged {
        return Err(ServiceError::validation("purged records cannot be listed"));
    }
    if limit < 0 || offset < 0 {
        return Err(ServiceError::validation(
            "limit and offset must not be negative",
        ));
    }
    Ok(())
}

/// Latest `deleted_at` a trashed record may have and still be expired
pub fn expiry_cutoff(now: DateTime<Utc>, retention_window: Duration) -> ServiceResult<DateTime<Utc>> {
    let window = chrono::Duration::from_std(retention_window)
        .map_err(|e| ServiceError::validation(format!("retention window out of range: {e}")))?;
    Ok(now - window)
}

/// Persistence gateway for users and analysis records.
///
/// Every user-scoped call filters on the owner; ids belonging to someone else
/// behave exactly like ids that do not exist.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Idempotent create-or-update keyed by `id`
    async fn upsert_user(&self, id: &str, email: &str) -> ServiceResult<User>;

    /// Look a user up by id
    async fn find_user(&self, id: &str) -> ServiceResult<Option<User>>;

    /// Insert a new record in the `Active` state
    async fn save(&self, record: NewRecord) -> ServiceResult<AnalysisRecord>;

    /// Records of one user in one state, newest first
    async fn list(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
        state: RecordState,
    ) -> ServiceResult<Vec<AnalysisRecord>>;

    /// One record of the user; trashed records are hidden unless `include_trash`
    async fn get_by_id(
        &self,
        id: i64,
        user_id: &str,
        include_trash: bool,
    ) -> ServiceResult<Option<AnalysisRecord>>;

    /// The subset of `ids` owned by the user and currently in `state`
    async fn list_by_ids(
        &self,
        ids: &[i64],
        user_id: &str,
        state: RecordState,
    ) -> ServiceResult<Vec<AnalysisRecord>>;

    /// Bulk transition; returns how many records actually changed
    async fn set_state(
        &self,
        ids: &[i64],
        user_id: &str,
        state: RecordState,
        deleted_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<u64>;

    /// Hard removal, used only by the purge path
    async fn delete(&self, ids: &[i64], user_id: &str) -> ServiceResult<u64>;

    /// Trashed records of every user whose `deleted_at` is at least `retention_window` old
    async fn find_expired_trash(
        &self,
        retention_window: Duration,
    ) -> ServiceResult<Vec<AnalysisRecord>>;

    /// Check database connectivity
    async fn health_check(&self) -> ServiceResult<()>;
}

/// Row shape of `analysis_records`
#[derive(Debug, FromRow)]
struct AnalysisRecordRow {
    id: i64,
    user_id: String,
    image_url: String,
    analysis_text: String,
    metadata: Json<ImageMetadata>,
    batch_no: Option<String>,
    state: String,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AnalysisRecordRow> for AnalysisRecord {
    type Error = ServiceError;

    fn try_from(row: AnalysisRecordRow) -> Result<Self, Self::Error> {
        let state = RecordState::try_from(row.state.as_str())
            .map_err(|e| ServiceError::Persistence(sqlx::Error::Decode(e.to_string().into())))?;

        if (state == RecordState::Trash) != row.deleted_at.is_some() {
            return Err(ServiceError::Persistence(sqlx::Error::Decode(
                format!("record {} has inconsistent trash state", row.id).into(),
            )));
        }

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            image_url: row.image_url,
            analysis_text: row.analysis_text,
            metadata: row.metadata.0,
            batch_no: row.batch_no.filter(|b| !b.is_empty()),
            state,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
        })
    }
}

fn into_records(rows: Vec<AnalysisRecordRow>) -> ServiceResult<Vec<AnalysisRecord>> {
    rows.into_iter().map(AnalysisRecord::try_from).collect()
}

const RECORD_COLUMNS: &str = "id, user_id, image_url, analysis_text, metadata, batch_no, \
                              state, deleted_at, created_at";

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, email))]
    async fn upsert_user(&self, id: &str, email: &str) -> ServiceResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, email, created_at
            "#,
        )
        .bind(id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        debug!(user_id = %id, "User upserted");
        Ok(user)
    }

    async fn find_user(&self, id: &str) -> ServiceResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self, record), fields(user_id = %record.user_id, batch_no = ?record.batch_no))]
    async fn save(&self, record: NewRecord) -> ServiceResult<AnalysisRecord> {
        record.validate()?;

        let sql = format!(
            r#"
            INSERT INTO analysis_records (
                user_id, image_url, analysis_text, metadata, batch_no,
                state, deleted_at, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, 'active', NULL, NOW()
            )
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, AnalysisRecordRow>(&sql)
            .bind(&record.user_id)
            .bind(&record.image_url)
            .bind(&record.analysis_text)
            .bind(Json(&record.metadata))
            .bind(record.batch_no.as_deref())
            .fetch_one(&self.pool)
            .await?;

        let saved = AnalysisRecord::try_from(row)?;
        debug!(record_id = saved.id, "Analysis record saved");
        Ok(saved)
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
        state: RecordState,
    ) -> ServiceResult<Vec<AnalysisRecord>> {
        validate_listing(limit, offset, state)?;

        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM analysis_records
            WHERE user_id = $1 AND state = $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        );

        let rows = sqlx::query_as::<_, AnalysisRecordRow>(&sql)
            .bind(user_id)
            .bind(state.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        into_records(rows)
    }

    async fn get_by_id(
        &self,
        id: i64,
        user_id: &str,
        include_trash: bool,
    ) -> ServiceResult<Option<AnalysisRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM analysis_records
            WHERE id = $1 AND user_id = $2 AND ($3 OR state = 'active')
            "#
        );

        let row = sqlx::query_as::<_, AnalysisRecordRow>(&sql)
            .bind(id)
            .bind(user_id)
            .bind(include_trash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AnalysisRecord::try_from).transpose()
    }

    async fn list_by_ids(
        &self,
        ids: &[i64],
        user_id: &str,
        state: RecordState,
    ) -> ServiceResult<Vec<AnalysisRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM analysis_records
            WHERE id = ANY($1) AND user_id = $2 AND state = $3
            ORDER BY id
            "#
        );

        let rows = sqlx::query_as::<_, AnalysisRecordRow>(&sql)
            .bind(ids)
            .bind(user_id)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        into_records(rows)
    }

    #[instrument(skip(self, ids), fields(id_count = ids.len()))]
    async fn set_state(
        &self,
        ids: &[i64],
        user_id: &str,
        state: RecordState,
        deleted_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<u64> {
        let prior = validate_transition(state, deleted_at)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE analysis_records
            SET state = $1, deleted_at = $2
            WHERE id = ANY($3) AND user_id = $4 AND state = $5
            "#,
        )
        .bind(state.as_str())
        .bind(deleted_at)
        .bind(ids)
        .bind(user_id)
        .bind(prior.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(id_count = ids.len()))]
    async fn delete(&self, ids: &[i64], user_id: &str) -> ServiceResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "DELETE FROM analysis_records WHERE id = ANY($1) AND user_id = $2",
        )
        .bind(ids)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn find_expired_trash(
        &self,
        retention_window: Duration,
    ) -> ServiceResult<Vec<AnalysisRecord>> {
        let cutoff = expiry_cutoff(Utc::now(), retention_window)?;

        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM analysis_records
            WHERE state = 'trash' AND deleted_at <= $1
            ORDER BY deleted_at ASC
            "#
        );

        let rows = sqlx::query_as::<_, AnalysisRecordRow>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        into_records(rows)
    }

    async fn health_check(&self) -> ServiceResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
