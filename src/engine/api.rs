//! CareLog API Module
//! REST surface for the audit log and the backup/restore pipeline, with
//! OpenAPI documentation

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::{OpenApi, ToSchema};

use crate::engine::audit::{AuditAction, AuditCategory, AuditError, AuditQuery, NewAuditEntry, SeqRange, Severity};
use crate::engine::backup::{detect_location, BackupError, RetentionPolicy, SnapshotRequest};
use crate::engine::error::{Classify, ErrorKind};
use crate::engine::installation::{Installation, InstallationError};
use crate::engine::keystore::CronAuth;
use crate::engine::restore::RestoreError;

pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct ApiState {
    pub install: Arc<Installation>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        list_audit,
        verify_audit,
        list_backups,
        create_backup,
        delete_backup,
        backup_location,
        apply_retention,
        restore_backup,
        restart_status,
        cron_backup,
    ),
    components(schemas(VerifyRequest, CreateBackupRequest, RetentionRequest, RestoreRequest)),
    tags(
        (name = "audit", description = "Audit log and integrity verification"),
        (name = "backups", description = "Backup artifacts and retention"),
        (name = "restore", description = "Restore and restart status"),
        (name = "cron", description = "Scheduled trigger"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/audit", get(list_audit))
        .route("/api/audit/verify", post(verify_audit))
        .route("/api/backups", get(list_backups).post(create_backup))
        .route("/api/backups/location", get(backup_location))
        .route("/api/backups/retention", post(apply_retention))
        .route("/api/backups/{file_name}", delete(delete_backup))
        .route("/api/restore", post(restore_backup))
        .route("/api/system/restart", get(restart_status))
        .route("/api/cron/backup", post(cron_backup))
        .route("/api/openapi.json", get(openapi_json))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body: `{"error": <code>, "message": <text>}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn classified(kind: ErrorKind, message: String) -> Self {
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Integrity | ErrorKind::Concurrency => StatusCode::CONFLICT,
            ErrorKind::Io | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, kind.as_str(), message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal.as_str(), message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.code, "message": self.message }))).into_response()
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        Self::classified(e.kind(), e.to_string())
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        Self::classified(e.kind(), e.to_string())
    }
}

impl From<RestoreError> for ApiError {
    fn from(e: RestoreError) -> Self {
        Self::classified(e.kind(), e.to_string())
    }
}

impl From<InstallationError> for ApiError {
    fn from(e: InstallationError) -> Self {
        match e {
            InstallationError::Audit(e) => e.into(),
            InstallationError::Backup(e) => e.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run subsystem work off the async executor. The task runs to completion
/// even if the request future is dropped.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn actor(headers: &HeaderMap) -> Option<String> {
    header_str(headers, ACTOR_HEADER).map(String::from)
}

async fn health_check(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "restart_pending": state.install.restart.is_pending(),
    }))
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/api/audit",
    params(
        ("actor_id" = Option<String>, Query, description = "Filter by actor"),
        ("entity_type" = Option<String>, Query, description = "Filter by entity type"),
        ("entity_id" = Option<String>, Query, description = "Filter by entity id"),
        ("action" = Option<String>, Query, description = "Filter by action"),
        ("category" = Option<String>, Query, description = "Filter by category"),
        ("from" = Option<String>, Query, description = "RFC 3339 lower bound"),
        ("to" = Option<String>, Query, description = "RFC 3339 upper bound"),
        ("order" = Option<String>, Query, description = "asc or desc (default)"),
        ("limit" = Option<usize>, Query, description = "Page size, max 1000"),
        ("offset" = Option<usize>, Query, description = "Page offset"),
    ),
    responses(
        (status = 200, description = "Page of audit entries", body = Value),
        (status = 400, description = "Invalid filter", body = Value)
    ),
    tag = "audit"
)]
async fn list_audit(State(state): State<ApiState>, Query(query): Query<AuditQuery>) -> ApiResult<Json<Value>> {
    blocking(move || {
        let page = state.install.audit.query(&query)?;
        serde_json::to_value(page).map(Json).map_err(|e| ApiError::internal(e.to_string()))
    })
    .await
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct VerifyRequest {
    pub from_seq: Option<i64>,
    pub to_seq: Option<i64>,
    pub limit: Option<usize>,
}

#[utoipa::path(
    post,
    path = "/api/audit/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Verification report", body = Value)
    ),
    tag = "audit"
)]
async fn verify_audit(State(state): State<ApiState>, Json(body): Json<VerifyRequest>) -> ApiResult<Json<Value>> {
    blocking(move || {
        let range = SeqRange {
            from_seq: body.from_seq,
            to_seq: body.to_seq,
        };
        let report = state.install.verifier.verify(&range, body.limit)?;
        Ok(Json(json!(report)))
    })
    .await
}

#[utoipa::path(
    get,
    path = "/api/backups",
    responses(
        (status = 200, description = "Backups, newest first", body = Value)
    ),
    tag = "backups"
)]
async fn list_backups(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    blocking(move || Ok(Json(json!(state.install.catalog.list()?)))).await
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateBackupRequest {
    #[serde(default)]
    pub encrypted: bool,
    pub description: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/backups",
    request_body = CreateBackupRequest,
    responses(
        (status = 201, description = "Backup created", body = Value),
        (status = 409, description = "A restore is in progress", body = Value),
        (status = 500, description = "Disk full, permission denied or media unavailable", body = Value)
    ),
    tag = "backups"
)]
async fn create_backup(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CreateBackupRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let actor = actor(&headers);
    blocking(move || {
        let request = SnapshotRequest::manual(actor.as_deref()).with_description(body.description.as_deref());
        let snapshot = state.install.serializer.create_snapshot(body.encrypted, &request)?;
        Ok((StatusCode::CREATED, Json(json!(snapshot))))
    })
    .await
}

#[utoipa::path(
    delete,
    path = "/api/backups/{file_name}",
    params(
        ("file_name" = String, Path, description = "Artifact file name"),
    ),
    responses(
        (status = 204, description = "Backup deleted"),
        (status = 400, description = "Name rejected by the allow-list", body = Value),
        (status = 404, description = "No such backup", body = Value)
    ),
    tag = "backups"
)]
async fn delete_backup(
    State(state): State<ApiState>,
    Path(file_name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let actor = actor(&headers);
    blocking(move || {
        state.install.catalog.delete(&file_name, actor.as_deref())?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

#[utoipa::path(
    get,
    path = "/api/backups/location",
    responses(
        (status = 200, description = "Suggested backup directory", body = Value)
    ),
    tag = "backups"
)]
async fn backup_location(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    blocking(move || {
        let detected = detect_location(&state.install.dir);
        Ok(Json(json!({
            "configured": state.install.catalog.backup_dir(),
            "detected": detected,
        })))
    })
    .await
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RetentionRequest {
    pub max_count: Option<usize>,
    pub max_age_days: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/api/backups/retention",
    request_body = RetentionRequest,
    responses(
        (status = 200, description = "Retention report", body = Value)
    ),
    tag = "backups"
)]
async fn apply_retention(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<RetentionRequest>,
) -> ApiResult<Json<Value>> {
    let actor = actor(&headers);
    blocking(move || {
        let configured = state.install.retention_policy();
        let policy = RetentionPolicy {
            max_count: body.max_count.unwrap_or(configured.max_count),
            max_age_days: body.max_age_days.unwrap_or(configured.max_age_days),
        };
        let report = state.install.catalog.enforce_retention(policy, actor.as_deref())?;
        Ok(Json(json!(report)))
    })
    .await
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RestoreRequest {
    pub file_name: String,
}

#[utoipa::path(
    post,
    path = "/api/restore",
    request_body = RestoreRequest,
    responses(
        (status = 200, description = "Restore committed; restart pending", body = Value),
        (status = 400, description = "Invalid name or secret", body = Value),
        (status = 409, description = "Backup or restore in progress", body = Value),
        (status = 500, description = "Restore rolled back", body = Value)
    ),
    tag = "restore"
)]
async fn restore_backup(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<RestoreRequest>,
) -> ApiResult<Json<Value>> {
    let actor = actor(&headers);
    blocking(move || {
        let outcome = state.install.orchestrator.restore(&body.file_name, actor.as_deref())?;
        Ok(Json(json!(outcome)))
    })
    .await
}

#[utoipa::path(
    get,
    path = "/api/system/restart",
    responses(
        (status = 200, description = "Whether a restart is pending", body = Value)
    ),
    tag = "restore"
)]
async fn restart_status(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "restart_pending": state.install.restart.is_pending() }))
}

#[utoipa::path(
    post,
    path = "/api/cron/backup",
    responses(
        (status = 200, description = "Scheduled backup and retention ran", body = Value),
        (status = 401, description = "No cron secret presented", body = Value),
        (status = 403, description = "Wrong cron secret", body = Value),
        (status = 503, description = "No cron secret configured", body = Value)
    ),
    security(("cron_secret" = [])),
    tag = "cron"
)]
async fn cron_backup(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let presented = header_str(&headers, header::AUTHORIZATION.as_str())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim());

    match state.install.secrets.check_cron(presented) {
        CronAuth::Authorized => {}
        CronAuth::Missing => {
            return Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing_cron_secret", "Bearer secret required"));
        }
        CronAuth::NotConfigured => {
            return Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "cron_not_configured",
                "No cron secret is configured for this installation",
            ));
        }
        CronAuth::Invalid => {
            let ip = header_str(&headers, "x-forwarded-for").map(String::from);
            let user_agent = header_str(&headers, header::USER_AGENT.as_str()).map(String::from);
            warn!(ip = ?ip, "cron trigger rejected: invalid secret");
            let install = state.install.clone();
            blocking(move || {
                install.audit.record(
                    NewAuditEntry::new(AuditAction::CronAuthFailed, AuditCategory::Security, "cron")
                        .with_severity(Severity::Warning)
                        .with_client(ip.as_deref(), user_agent.as_deref()),
                );
                Ok(())
            })
            .await?;
            return Err(ApiError::new(StatusCode::FORBIDDEN, "invalid_cron_secret", "Cron secret rejected"));
        }
    }

    blocking(move || {
        let (snapshot, retention) = state.install.scheduled_backup()?;
        Ok(Json(json!({ "snapshot": snapshot, "retention": retention })))
    })
    .await
}
