//! Axum JSON control surface for starting, stopping and polling sync runs.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use lsync_core::{SyncJobType, SyncScope};
use lsync_sync::{JobSupervisor, StartOptions, SupervisorError, SyncConfig, DEFAULT_HISTORY_LIMIT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "lsync-web";

#[derive(Clone)]
pub struct AppState {
    pub supervisor: JobSupervisor,
}

impl AppState {
    pub fn new(supervisor: JobSupervisor) -> Self {
        Self { supervisor }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScopeKind {
    #[default]
    Full,
    Incremental,
    Subset,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    scope: ScopeKind,
    batch_size: Option<u32>,
    delay_ms: Option<u64>,
    entity_ids: Option<Vec<String>>,
    since: Option<DateTime<Utc>>,
    initiated_by: Option<String>,
}

impl StartRequest {
    fn scope(&self) -> SyncScope {
        match self.scope {
            ScopeKind::Full => SyncScope::Full,
            ScopeKind::Incremental => SyncScope::Incremental { since: self.since },
            ScopeKind::Subset => SyncScope::Subset {
                entity_ids: self.entity_ids.clone().unwrap_or_default(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    id: i64,
    message: String,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetailsQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

/// `{ message }` error body with the status code matching the failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            SupervisorError::NotRunning { .. }
            | SupervisorError::NotFound(_)
            | SupervisorError::NotConfigured(_) => StatusCode::NOT_FOUND,
            SupervisorError::Invalid(_) => StatusCode::BAD_REQUEST,
            SupervisorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "sync request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn job_type(raw: &str) -> Result<SyncJobType, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("unknown job type `{raw}`")))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync/{job_type}/start", post(start_handler))
        .route("/sync/{job_type}/stop", delete(stop_handler))
        .route("/sync/{job_type}/stop/{id}", delete(stop_by_id_handler))
        .route("/sync/{job_type}/status", get(status_handler))
        .route("/sync/{job_type}/history", get(history_handler))
        .route("/sync/{job_type}/{id}/details", get(details_handler))
        .route("/sync/{job_type}/cleanup", post(cleanup_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(supervisor: JobSupervisor, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "sync control surface listening");
    axum::serve(listener, app(AppState::new(supervisor))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    let supervisor = lsync_sync::build_supervisor(config).await?;
    serve(supervisor, port).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_job): Path<String>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult<StartResponse> {
    let job_type = job_type(&raw_job)?;
    let Json(request) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let options = StartOptions {
        batch_size: request.batch_size,
        delay_ms: request.delay_ms,
        initiated_by: request.initiated_by.clone(),
    };
    let log = state.supervisor.start(job_type, request.scope(), options).await?;
    Ok(Json(StartResponse {
        id: log.id,
        message: format!("{job_type} sync started ({} scope)", log.scope.kind()),
    }))
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_job): Path<String>,
) -> ApiResult<serde_json::Value> {
    let job_type = job_type(&raw_job)?;
    let log = state.supervisor.stop(job_type, None).await?;
    Ok(Json(json!({ "message": format!("stop requested for {job_type} sync {}", log.id) })))
}

async fn stop_by_id_handler(
    State(state): State<Arc<AppState>>,
    Path((raw_job, id)): Path<(String, i64)>,
) -> ApiResult<serde_json::Value> {
    let job_type = job_type(&raw_job)?;
    let log = state.supervisor.stop(job_type, Some(id)).await?;
    Ok(Json(json!({ "message": format!("stop requested for {job_type} sync {}", log.id) })))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_job): Path<String>,
) -> ApiResult<lsync_sync::StatusView> {
    let job_type = job_type(&raw_job)?;
    Ok(Json(state.supervisor.status(job_type).await?))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_job): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<lsync_core::SyncLog>> {
    let job_type = job_type(&raw_job)?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.supervisor.history(job_type, limit).await?))
}

async fn details_handler(
    State(state): State<Arc<AppState>>,
    Path((raw_job, id)): Path<(String, i64)>,
    Query(query): Query<DetailsQuery>,
) -> ApiResult<lsync_core::Page<lsync_core::SyncDetail>> {
    let job_type = job_type(&raw_job)?;
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);
    Ok(Json(state.supervisor.details(job_type, id, page, limit).await?))
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_job): Path<String>,
) -> ApiResult<serde_json::Value> {
    let job_type = job_type(&raw_job)?;
    let cleaned = state.supervisor.cleanup_stale(Some(job_type)).await?;
    Ok(Json(json!({
        "message": format!("{} stale {job_type} sync(s) marked failed", cleaned.len()),
        "cleaned": cleaned,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use lsync_adapters::{builtin_table, DomainAdapter, MemoryConnector, StaticRegistry};
    use lsync_core::SyncStatus;
    use lsync_storage::MemoryStore;
    use serde_json::Value;
    use tower::ServiceExt;

    fn supervisor() -> JobSupervisor {
        let rows = (1..=120)
            .map(|i| match json!({"id": i, "garage_no": format!("P{i}"), "active": 1}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            })
            .collect::<Vec<_>>();
        let registry = StaticRegistry::new().with(SyncJobType::Vehicles, move || {
            Ok(DomainAdapter::new(
                SyncJobType::Vehicles,
                Box::new(MemoryConnector::new("ticketing", builtin_table(SyncJobType::Vehicles), rows.clone())),
            ))
        });
        let store = Arc::new(MemoryStore::new());
        let config = SyncConfig {
            default_delay_ms: 0,
            ..SyncConfig::default()
        };
        JobSupervisor::new(config, store.clone(), store, Arc::new(registry))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn delete_req(uri: &str) -> Request<Body> {
        Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = app(AppState::new(supervisor())).oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn start_conflict_and_stop_lifecycle() {
        let supervisor = supervisor();
        let app = app(AppState::new(supervisor.clone()));

        // long delay keeps the run active between the first and second batch
        let resp = app
            .clone()
            .oneshot(post_json(
                "/sync/vehicles/start",
                json!({"scope": "full", "batchSize": 50, "delayMs": 60_000, "initiatedBy": "ops"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let started = json_body(resp).await;
        let id = started["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json("/sync/vehicles/start", json!({"scope": "full"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(json_body(resp).await["message"].as_str().unwrap().contains("already running"));

        let resp = app.clone().oneshot(get_req("/sync/vehicles/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status = json_body(resp).await;
        assert_eq!(status["isRunning"], true);
        assert_eq!(status["syncLog"]["id"], id);

        let resp = app
            .clone()
            .oneshot(delete_req(&format!("/sync/vehicles/stop/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let done = supervisor.wait_for(id).await.unwrap();
        assert_eq!(done.status, SyncStatus::Cancelled);
        assert!(done.processed_units < 120);

        let resp = app.oneshot(delete_req("/sync/vehicles/stop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_unknown_or_unconfigured_job_types() {
        let app = app(AppState::new(supervisor()));

        let resp = app
            .clone()
            .oneshot(post_json("/sync/trams/start", json!({"scope": "full"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["message"].as_str().unwrap().contains("trams"));

        let resp = app
            .clone()
            .oneshot(post_json("/sync/stops/start", json!({"scope": "full"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(post_json("/sync/vehicles/start", json!({"batchSize": 0})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post_json("/sync/vehicles/start", json!({"scope": "subset", "entityIds": []})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn history_and_details_after_a_completed_run() {
        let supervisor = supervisor();
        let app = app(AppState::new(supervisor.clone()));

        let resp = app
            .clone()
            .oneshot(post_json("/sync/vehicles/start", json!({"scope": "full", "batchSize": 50, "delayMs": 0})))
            .await
            .unwrap();
        let id = json_body(resp).await["id"].as_i64().unwrap();
        supervisor.wait_for(id).await.unwrap();

        let resp = app.clone().oneshot(get_req("/sync/vehicles/history?limit=5")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let history = json_body(resp).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["status"], "completed");
        assert_eq!(history[0]["createdCount"], 120);

        let resp = app
            .clone()
            .oneshot(get_req(&format!("/sync/vehicles/{id}/details?page=3&limit=50")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page = json_body(resp).await;
        assert_eq!(page["total"], 120);
        assert_eq!(page["totalPages"], 3);
        assert_eq!(page["data"].as_array().unwrap().len(), 20);

        let resp = app
            .clone()
            .oneshot(get_req("/sync/vehicles/status"))
            .await
            .unwrap();
        let status = json_body(resp).await;
        assert_eq!(status["isRunning"], false);
        assert_eq!(status["progress"]["outcome"], "succeeded");

        let resp = app.oneshot(post_json("/sync/vehicles/cleanup", json!({}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["cleaned"], json!([]));
    }
}
