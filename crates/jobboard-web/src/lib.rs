//! JSON API: Greenhouse sync trigger and preview, plus the job CRUD/search surface.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jobboard_core::{Job, JobPage, JobPatch, JobSearchQuery};
use jobboard_storage::JobStore;
use jobboard_sync::{BoardPreview, SyncPipeline};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

pub mod dto;
mod error;

pub use error::{ApiError, ApiResult};

use dto::{
    ApplyRequest, MessageResponse, NewJobPayload, PageParams, SyncRequest, SyncResponse,
};

pub const CRATE_NAME: &str = "jobboard-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            store: pipeline.store().clone(),
            pipeline,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler).post(create_job_handler))
        .route("/jobs/search", get(search_jobs_handler))
        .route("/jobs/sync-greenhouse", post(sync_greenhouse_handler))
        .route("/jobs/greenhouse/{board_token}", get(preview_greenhouse_handler))
        .route(
            "/jobs/{id}",
            get(get_job_handler)
                .put(update_job_handler)
                .delete(delete_job_handler),
        )
        .route("/jobs/{id}/apply", post(apply_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "job board api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

fn job_not_found() -> ApiError {
    ApiError::NotFound("Job not found".to_string())
}

/// Ids are opaque to clients, so a malformed one is simply an unknown job.
fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| job_not_found())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn sync_greenhouse_handler(
    State(state): State<AppState>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> ApiResult<Json<SyncResponse>> {
    let Json(req) = payload?;
    req.validate()
        .map_err(|_| ApiError::BadRequest("Board token is required".to_string()))?;

    let summary = state.pipeline.sync_board(&req.board_token).await?;
    Ok(Json(SyncResponse {
        message: "Greenhouse jobs synced successfully".to_string(),
        summary,
    }))
}

async fn preview_greenhouse_handler(
    State(state): State<AppState>,
    Path(board_token): Path<String>,
) -> ApiResult<Json<BoardPreview>> {
    Ok(Json(state.pipeline.preview_board(&board_token).await?))
}

async fn create_job_handler(
    State(state): State<AppState>,
    payload: Result<Json<NewJobPayload>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let Json(new_job) = payload?;
    new_job.validate()?;
    let job = state.store.create(new_job.into_posting(Utc::now())).await?;
    info!(id = %job.id, "job created");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(
    State(state): State<AppState>,
    params: Result<Query<PageParams>, QueryRejection>,
) -> ApiResult<Json<JobPage>> {
    let Query(params) = params?;
    let query = JobSearchQuery {
        page: params.page,
        size: params.size,
        ..JobSearchQuery::default()
    };
    Ok(Json(state.store.search(&query).await?))
}

async fn search_jobs_handler(
    State(state): State<AppState>,
    query: Result<Query<JobSearchQuery>, QueryRejection>,
) -> ApiResult<Json<JobPage>> {
    let Query(query) = query?;
    Ok(Json(state.store.search(&query).await?))
}

async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(job_not_found)
}

async fn update_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<JobPatch>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    let Json(patch) = payload?;
    state
        .store
        .update(id, &patch)
        .await?
        .map(Json)
        .ok_or_else(job_not_found)
}

async fn delete_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    let id = parse_job_id(&id)?;
    if state.store.delete(id).await? {
        info!(%id, "job deleted");
        Ok(Json(MessageResponse {
            message: "Job deleted",
        }))
    } else {
        Err(job_not_found())
    }
}

async fn apply_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ApplyRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(req) = payload?;
    let req = req.trimmed();
    req.validate()
        .map_err(|_| ApiError::BadRequest("Missing userId".to_string()))?;
    let id = parse_job_id(&id)?;

    state
        .store
        .add_applicant(id, &req.user_id)
        .await?
        .ok_or_else(job_not_found)?;
    Ok(Json(MessageResponse {
        message: "Application successful",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path as FsPath;

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use jobboard_adapters::{load_board_fixture, FixtureSource};
    use jobboard_storage::InMemoryJobStore;
    use serde_json::Value;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: Arc<InMemoryJobStore>,
        source: Arc<FixtureSource>,
    }

    fn harness() -> Harness {
        let fixture = FsPath::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/greenhouse/acme-board.json");
        let records = load_board_fixture(fixture).expect("fixture");
        let store = Arc::new(InMemoryJobStore::new());
        let source = Arc::new(FixtureSource::new().with_board("acme", records));
        let pipeline = Arc::new(SyncPipeline::new(source.clone(), store.clone()));
        Harness {
            app: app(AppState::new(pipeline)),
            store,
            source,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let h = harness();
        let (status, body) = send(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sync_endpoint_returns_summary_and_persists_jobs() {
        let h = harness();
        let (status, body) = send(
            &h.app,
            "POST",
            "/jobs/sync-greenhouse",
            Some(json!({ "boardToken": "acme" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Greenhouse jobs synced successfully");
        assert_eq!(body["total"], 5);
        assert_eq!(body["synced"], 5);
        assert_eq!(body["errors"], 0);
        assert_eq!(body["board"], "acme");
        assert!(body["runId"].is_string());
        assert_eq!(h.store.len().await, 5);

        let (status, page) = send(&h.app, "GET", "/jobs?page=1&size=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 5);
        assert_eq!(page["page"], 1);
        assert_eq!(page["jobs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sync_without_board_token_is_rejected() {
        let h = harness();
        let (status, body) = send(&h.app, "POST", "/jobs/sync-greenhouse", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Board token is required");

        let (status, _) = send(
            &h.app,
            "POST",
            "/jobs/sync-greenhouse",
            Some(json!({ "boardToken": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn unreachable_board_maps_to_bad_gateway() {
        let h = harness();
        h.source.fail_board("acme", "upstream timed out").await;
        let (status, body) = send(
            &h.app,
            "POST",
            "/jobs/sync-greenhouse",
            Some(json!({ "boardToken": "acme" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("upstream timed out"));

        let (status, _) = send(&h.app, "GET", "/jobs/greenhouse/acme", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn preview_returns_display_jobs_without_writing() {
        let h = harness();
        let (status, body) = send(&h.app, "GET", "/jobs/greenhouse/acme", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 5);
        let first = &body["jobs"][0];
        assert_eq!(first["id"], "gh_4001");
        assert_eq!(first["type"], "REMOTE");
        assert_eq!(first["salary"], "Competitive");
        assert_eq!(first["applicants"], json!([]));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn job_crud_round_trip() {
        let h = harness();
        let (status, created) = send(
            &h.app,
            "POST",
            "/jobs",
            Some(json!({ "title": "Platform Engineer", "company": "Acme", "location": "Denver" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["applicants"], json!([]));
        assert_eq!(created["type"], "FULL_TIME");

        let (status, fetched) = send(&h.app, "GET", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["title"], "Platform Engineer");

        let (status, updated) = send(
            &h.app,
            "PUT",
            &format!("/jobs/{id}"),
            Some(json!({ "title": "Staff Platform Engineer", "salary": "$150k" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["title"], "Staff Platform Engineer");
        assert_eq!(updated["company"], "Acme");
        assert_eq!(updated["salary"], "$150k");

        let (status, deleted) = send(&h.app, "DELETE", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["message"], "Job deleted");

        let (status, body) = send(&h.app, "GET", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Job not found");

        let (status, _) = send(&h.app, "DELETE", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_requires_title_and_company() {
        let h = harness();
        let (status, body) = send(&h.app, "POST", "/jobs", Some(json!({ "company": "Acme" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("title"));
    }

    #[tokio::test]
    async fn update_rejects_expiry_before_posting() {
        let h = harness();
        let (_, created) = send(
            &h.app,
            "POST",
            "/jobs",
            Some(json!({ "title": "Analyst", "company": "Acme" })),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();
        let (status, _) = send(
            &h.app,
            "PUT",
            &format!("/jobs/{id}"),
            Some(json!({ "expiryDate": "2000-01-01T00:00:00Z" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn apply_validates_and_appends_once() {
        let h = harness();
        let (_, created) = send(
            &h.app,
            "POST",
            "/jobs",
            Some(json!({ "title": "Analyst", "company": "Acme" })),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();
        let apply_uri = format!("/jobs/{id}/apply");

        let (status, body) = send(&h.app, "POST", &apply_uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing userId");

        let (status, body) =
            send(&h.app, "POST", &apply_uri, Some(json!({ "userId": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing userId");
        let (_, job) = send(&h.app, "GET", &format!("/jobs/{id}"), None).await;
        assert_eq!(job["applicants"], json!([]));

        let (status, body) = send(
            &h.app,
            "POST",
            &format!("/jobs/{}/apply", Uuid::new_v4()),
            Some(json!({ "userId": "u1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Job not found");

        for _ in 0..2 {
            let (status, body) =
                send(&h.app, "POST", &apply_uri, Some(json!({ "userId": " u1 " }))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "Application successful");
        }
        let (_, job) = send(&h.app, "GET", &format!("/jobs/{id}"), None).await;
        assert_eq!(job["applicants"], json!(["u1"]));
    }

    #[tokio::test]
    async fn search_filters_synced_jobs() {
        let h = harness();
        send(
            &h.app,
            "POST",
            "/jobs/sync-greenhouse",
            Some(json!({ "boardToken": "acme" })),
        )
        .await;

        let (status, body) = send(&h.app, "GET", "/jobs/search?keyword=python", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["jobs"][0]["title"], "Backend Developer");

        let (_, body) = send(&h.app, "GET", "/jobs/search?type=REMOTE", None).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["jobs"][0]["externalId"], "4001");

        let (_, body) = send(&h.app, "GET", "/jobs/search?location=chicago&size=1", None).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["size"], 1);

        let (status, _) = send(&h.app, "GET", "/jobs/search?page=abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_ids_are_not_found() {
        let h = harness();
        let (status, _) = send(&h.app, "GET", "/jobs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
