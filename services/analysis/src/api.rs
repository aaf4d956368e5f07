use crate::batch_coordinator::{BatchOutcome, BatchUploadCoordinator, Identity, UploadedImage};
use crate::config::ApiConfig;
use crate::error::ServiceError;
use crate::lifecycle::LifecycleManager;
use crate::prompts::Locale;
use crate::record_store::{AnalysisRecord, RecordState, RecordStore, User};
use crate::sweeper::RetentionSweeper;
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State,
    },
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

const USER_ID_HEADER: &str = "x-user-id";
const USER_EMAIL_HEADER: &str = "x-user-email";
const MAINTENANCE_TOKEN_HEADER: &str = "x-maintenance-token";

const DEFAULT_PAGE_SIZE: i64 = 10;
const MAX_PAGE_SIZE: i64 = 100;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub coordinator: Arc<BatchUploadCoordinator>,
    pub lifecycle: Arc<LifecycleManager>,
    pub sweeper: Arc<RetentionSweeper>,
    /// Locale used when an upload names none, or an unknown one
    pub default_locale: Locale,
    /// Shared secret for maintenance calls; maintenance is disabled when unset
    pub maintenance_token: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned by handlers, rendered as [`ErrorResponse`]
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        ServiceError::Authorization(message.into()).into()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let code = err.code();
        match err {
            ServiceError::Validation(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code,
                message,
            },
            ServiceError::Authorization(message) => Self {
                status: StatusCode::UNAUTHORIZED,
                code,
                message,
            },
            other => {
                error!(error = %other, code, "Request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    message: "Internal server error".to_string(),
                }
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::validation(rejection.body_text()).into()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ServiceError::validation(rejection.body_text()).into()
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ServiceError::validation(rejection.body_text()).into()
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ServiceError::validation(rejection.body_text()).into()
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ServiceError::validation(format!("invalid multipart body: {}", err.body_text())).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Read the caller identity forwarded by the identity provider
fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    Some(Identity {
        user_id: header(USER_ID_HEADER)?,
        email: header(USER_EMAIL_HEADER),
    })
}

/// Extractor for endpoints that require an identity
pub struct Authenticated(pub Identity);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from_headers(&parts.headers)
            .map(Authenticated)
            .ok_or_else(|| ApiError::unauthorized("missing user identity"))
    }
}

/// Extractor for endpoints open to anonymous callers
pub struct MaybeAuthenticated(pub Option<Identity>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for MaybeAuthenticated {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuthenticated(identity_from_headers(&parts.headers)))
    }
}

/// Compare secrets without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Query parameters for record listing
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Page size (default 10, capped at 100)
    pub limit: Option<i64>,
    /// Records to skip
    #[serde(default)]
    pub offset: i64,
    /// `active` (default) or `trash`
    pub state: Option<String>,
}

/// Record in API responses
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    #[serde(flatten)]
    pub record: AnalysisRecord,
    /// When a trashed record becomes eligible for automatic purge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge_after: Option<DateTime<Utc>>,
}

impl RecordView {
    fn new(record: AnalysisRecord, retention_window: Duration) -> Self {
        let purge_after = record.deleted_at.and_then(|deleted_at| {
            chrono::Duration::from_std(retention_window)
                .ok()
                .map(|window| deleted_at + window)
        });
        Self {
            record,
            purge_after,
        }
    }
}

/// Record list response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub records: Vec<RecordView>,
    pub has_more: bool,
}

/// Single record response
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub record: RecordView,
}

/// Body of the lifecycle endpoints
#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<i64>,
}

/// Result of a lifecycle transition
#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Result of a maintenance sweep
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResponse {
    pub purged_count: u64,
}

/// Result of a user sync
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: User,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/analyses", post(upload_batch).get(list_records))
        .route("/api/v1/analyses/:id", get(get_record))
        .route("/api/v1/lifecycle/soft-delete", patch(soft_delete))
        .route("/api/v1/lifecycle/restore", patch(restore))
        .route("/api/v1/lifecycle/purge", delete(purge))
        .route("/api/v1/maintenance/sweep-trash", post(sweep_trash))
        .route("/api/v1/users/sync", post(sync_user))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "analysis-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Analyze uploaded photos; authenticated callers also get them stored
#[instrument(skip_all)]
async fn upload_batch(
    State(state): State<AppState>,
    MaybeAuthenticated(identity): MaybeAuthenticated,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchOutcome>, ApiError> {
    let mut multipart = multipart?;
    let mut images = Vec::new();
    let mut locale_tag = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") | Some("images") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("image-{}", images.len() + 1));
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await?;
                images.push(UploadedImage {
                    bytes,
                    mime_type,
                    filename,
                });
            }
            Some("locale") => {
                locale_tag = Some(field.text().await?);
            }
            _ => {}
        }
    }

    let locale = Locale::resolve_or(locale_tag.as_deref(), state.default_locale);
    let outcome = state
        .coordinator
        .process_batch(identity.as_ref(), images, locale)
        .await?;

    Ok(Json(outcome))
}

/// List the caller's records
#[instrument(skip_all, fields(user_id = %identity.user_id))]
async fn list_records(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let Query(params) = query?;
    let record_state = match params.state.as_deref() {
        None => RecordState::Active,
        Some(s) => RecordState::try_from(s)?,
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    // Fetch one extra to check has_more
    let mut records = state
        .store
        .list(&identity.user_id, limit + 1, params.offset, record_state)
        .await?;

    let has_more = records.len() > limit as usize;
    if has_more {
        records.pop();
    }

    let window = state.sweeper.retention_window();
    Ok(Json(ListResponse {
        records: records
            .into_iter()
            .map(|r| RecordView::new(r, window))
            .collect(),
        has_more,
    }))
}

/// Get one active record of the caller
#[instrument(skip_all, fields(user_id = %identity.user_id))]
async fn get_record(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<RecordResponse>, ApiError> {
    let Path(id) = path?;
    let record = state
        .store
        .get_by_id(id, &identity.user_id, false)
        .await?
        .ok_or_else(|| ApiError::not_found("Record not found"))?;

    Ok(Json(RecordResponse {
        record: RecordView::new(record, state.sweeper.retention_window()),
    }))
}

/// Apply one lifecycle transition to the ids in the body
async fn transition<F, Fut>(
    identity: Identity,
    body: Result<Json<IdsRequest>, JsonRejection>,
    apply: F,
) -> Result<Json<CountResponse>, ApiError>
where
    F: FnOnce(Vec<i64>, String) -> Fut,
    Fut: Future<Output = Result<u64, ServiceError>>,
{
    let Json(request) = body?;
    let count = apply(request.ids, identity.user_id).await?;
    Ok(Json(CountResponse { count }))
}

#[instrument(skip_all)]
async fn soft_delete(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    body: Result<Json<IdsRequest>, JsonRejection>,
) -> Result<Json<CountResponse>, ApiError> {
    transition(identity, body, |ids, user_id| async move {
        state.lifecycle.soft_delete(&ids, &user_id).await
    })
    .await
}

#[instrument(skip_all)]
async fn restore(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    body: Result<Json<IdsRequest>, JsonRejection>,
) -> Result<Json<CountResponse>, ApiError> {
    transition(identity, body, |ids, user_id| async move {
        state.lifecycle.restore(&ids, &user_id).await
    })
    .await
}

#[instrument(skip_all)]
async fn purge(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    body: Result<Json<IdsRequest>, JsonRejection>,
) -> Result<Json<CountResponse>, ApiError> {
    transition(identity, body, |ids, user_id| async move {
        state.lifecycle.purge(&ids, &user_id).await
    })
    .await
}

/// Purge expired trash of every user; trusted callers only
#[instrument(skip_all)]
async fn sweep_trash(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    let expected = state
        .maintenance_token
        .as_deref()
        .ok_or_else(|| ApiError::unauthorized("maintenance endpoint is disabled"))?;
    let provided = headers
        .get(MAINTENANCE_TOKEN_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !constant_time_eq(provided, expected.as_bytes()) {
        return Err(ApiError::unauthorized("invalid maintenance token"));
    }

    let purged_count = state.sweeper.sweep().await?;
    Ok(Json(SweepResponse { purged_count }))
}

/// Create or refresh the caller's user row
#[instrument(skip(state, identity), fields(user_id = %identity.user_id))]
async fn sync_user(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> Result<Json<UserResponse>, ApiError> {
    let email = identity
        .email
        .as_deref()
        .ok_or_else(|| ServiceError::validation("identity carries no email"))?;
    let user = state.store.upsert_user(&identity.user_id, email).await?;
    Ok(Json(UserResponse { user }))
}

/// Start the analysis API server; returns once `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting analysis API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::testing::{scripted_invoker, MemoryBlobGateway, MemoryRecordStore};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    fn api_config() -> ApiConfig {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_enabled: false,
            cors_origins: vec![],
            max_upload_bytes: 1024 * 1024,
            maintenance_token: Some("s3cret".to_string()),
        }
    }

    fn router() -> (Router, Arc<MemoryRecordStore>) {
        let store = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobGateway::new());
        let lifecycle = Arc::new(LifecycleManager::new(store.clone(), blobs.clone()));
        let coordinator = Arc::new(BatchUploadCoordinator::new(
            store.clone(),
            blobs.clone(),
            scripted_invoker(),
            &BatchConfig::default(),
            "analyses",
        ));
        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            lifecycle.clone(),
            THIRTY_DAYS,
        ));
        let config = api_config();
        let state = AppState {
            store: store.clone(),
            coordinator,
            lifecycle,
            sweeper,
            default_locale: Locale::ZhTw,
            maintenance_token: config.maintenance_token.clone(),
        };
        (create_router(state, &config), store)
    }

    fn multipart_request(parts: &[(&str, Option<&str>, &str)], user_id: Option<&str>) -> Request<Body> {
        let mut body = String::new();
        for (name, filename, content) in parts {
            body.push_str("--BOUNDARY\r\n");
            match filename {
                Some(filename) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: image/jpeg\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str("--BOUNDARY--\r\n");

        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/analyses")
            .header("content-type", "multipart/form-data; boundary=BOUNDARY");
        if let Some(user_id) = user_id {
            builder = builder
                .header(USER_ID_HEADER, user_id)
                .header(USER_EMAIL_HEADER, format!("{user_id}@example.com"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: &str, user_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user_id) = user_id {
            builder = builder.header(USER_ID_HEADER, user_id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = router();
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_requires_identity() {
        let (router, _) = router();
        let response = router
            .oneshot(Request::get("/api/v1/analyses").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_upload_without_images_is_rejected() {
        let (router, _) = router();
        let response = router
            .oneshot(multipart_request(&[("locale", None, "en")], Some("user_1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_anonymous_upload_is_not_persisted() {
        let (router, store) = router();
        let response = router
            .oneshot(multipart_request(
                &[("image", Some("a.jpg"), "photo"), ("locale", None, "en")],
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["locale"], "en");
        assert_eq!(json["results"][0]["status"], "unsaved");
        assert_eq!(json["results"][0]["filename"], "a.jpg");
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_upload_then_list_and_trash() {
        let (router, _) = router();

        let response = router
            .clone()
            .oneshot(multipart_request(
                &[("image", Some("a.jpg"), "first"), ("image", Some("b.jpg"), "second")],
                Some("user_1"),
            ))
            .await
            .unwrap();
        let upload = body_json(response).await;
        assert_eq!(upload["results"][0]["status"], "saved");
        let id = upload["results"][0]["recordId"].as_i64().unwrap();

        let response = router
            .clone()
            .oneshot(json_request("GET", "/api/v1/analyses?limit=1", "", Some("user_1")))
            .await
            .unwrap();
        let listing = body_json(response).await;
        assert_eq!(listing["records"].as_array().unwrap().len(), 1);
        assert_eq!(listing["hasMore"], true);

        let response = router
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/v1/lifecycle/soft-delete",
                &format!(r#"{{"ids":[{id}]}}"#),
                Some("user_1"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["count"], 1);

        let response = router
            .clone()
            .oneshot(json_request("GET", "/api/v1/analyses?state=trash", "", Some("user_1")))
            .await
            .unwrap();
        let listing = body_json(response).await;
        assert_eq!(listing["records"].as_array().unwrap().len(), 1);
        assert_eq!(listing["records"][0]["id"], id);
        assert_eq!(listing["records"][0]["state"], "trash");
        assert!(listing["records"][0]["purgeAfter"].is_string());
        assert_eq!(listing["hasMore"], false);

        let response = router
            .clone()
            .oneshot(json_request("GET", "/api/v1/analyses?limit=1", "", Some("user_1")))
            .await
            .unwrap();
        let listing = body_json(response).await;
        assert_eq!(listing["records"].as_array().unwrap().len(), 1);
        assert!(listing["records"][0].get("purgeAfter").is_none());

        let response = router
            .oneshot(json_request(
                "GET",
                &format!("/api/v1/analyses/{id}"),
                "",
                Some("user_1"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_lifecycle_rejects_empty_or_non_numeric_ids() {
        let (router, _) = router();
        for body in [r#"{"ids":[]}"#, r#"{"ids":["abc"]}"#, "not json"] {
            let response = router
                .clone()
                .oneshot(json_request(
                    "PATCH",
                    "/api/v1/lifecycle/soft-delete",
                    body,
                    Some("user_1"),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn test_invalid_state_filter_is_rejected() {
        let (router, _) = router();
        let response = router
            .oneshot(json_request("GET", "/api/v1/analyses?state=purged", "", Some("user_1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_query_path_and_body_are_json_errors() {
        let (router, _) = router();

        for uri in ["/api/v1/analyses?limit=abc", "/api/v1/analyses/abc"] {
            let response = router
                .clone()
                .oneshot(json_request("GET", uri, "", Some("user_1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri: {uri}");
            let json = body_json(response).await;
            assert_eq!(json["code"], "VALIDATION_ERROR", "uri: {uri}");
            assert!(json["error"].is_string(), "uri: {uri}");
        }

        let response = router
            .oneshot(json_request("POST", "/api/v1/analyses", "{}", Some("user_1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_sweep_requires_maintenance_token() {
        let (router, _) = router();

        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/v1/maintenance/sweep-trash", "", Some("user_1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::post("/api/v1/maintenance/sweep-trash")
            .header(MAINTENANCE_TOKEN_HEADER, "s3cret")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["purgedCount"], 0);
    }

    #[tokio::test]
    async fn test_user_sync() {
        let (router, store) = router();

        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/v1/users/sync", "", Some("user_1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::post("/api/v1/users/sync")
            .header(USER_ID_HEADER, "user_1")
            .header(USER_EMAIL_HEADER, "site@example.com")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user"]["email"], "site@example.com");
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"token", b"token2"));
        assert!(!constant_time_eq(b"", b"token"));
    }

    #[test]
    fn test_identity_headers() {
        let mut headers = HeaderMap::new();
        assert!(identity_from_headers(&headers).is_none());

        headers.insert(USER_ID_HEADER, "  ".parse().unwrap());
        assert!(identity_from_headers(&headers).is_none());

        headers.insert(USER_ID_HEADER, "user_1".parse().unwrap());
        let identity = identity_from_headers(&headers).unwrap();
        assert_eq!(identity.user_id, "user_1");
        assert_eq!(identity.email, None);
    }
}
