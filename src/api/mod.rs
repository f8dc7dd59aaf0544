//! HTTP surface: REST endpoints for submission and worker reports, plus the
//! event WebSocket.

pub mod error;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::model::{JobStatus, WorkerStatus};
use crate::orchestrator::Orchestrator;
use error::{ApiError, ApiResult};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router with every REST route and `/ws/events`.
pub fn routes(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(ws::ws_handler))
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/allocations", get(list_allocations))
        .route("/api/workers", post(register_worker).get(list_workers))
        .route("/api/workers/{id}", get(get_worker).delete(delete_worker))
        .route("/api/workers/{id}/heartbeat", post(heartbeat))
        .route("/api/workers/{id}/assignment", get(current_assignment))
        .route("/api/workers/{id}/complete", post(report_completion))
        .route("/api/workers/{id}/fail", post(report_failure))
        .route("/api/workers/{id}/reset", post(reset_worker))
        .route("/api/workers/{id}/terminate", post(terminate_worker))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "assist-orchestrator"
    }))
}

fn parse_status<T: std::str::FromStr<Err = String>>(raw: Option<&str>) -> ApiResult<Option<T>> {
    raw.map(|s| s.parse::<T>().map_err(ApiError::BadRequest))
        .transpose()
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubmitRequest {
    idempotency_key: String,
    #[serde(default)]
    task: serde_json::Value,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .orchestrator
        .submit(&body.idempotency_key, body.task)
        .await?;
    let status = if receipt.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt)))
}

#[derive(Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = parse_status::<JobStatus>(query.status.as_deref())?;
    let jobs = state.orchestrator.list_jobs(status, query.limit).await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.get_job(&id).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = state.orchestrator.cancel(&id).await?;
    Ok(Json(serde_json::json!({ "job_id": id, "status": status })))
}

async fn list_allocations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.list_allocations(&id).await?))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Workers ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterRequest {
    /// Generated when omitted.
    id: Option<String>,
    endpoint: Option<String>,
}

async fn register_worker(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = body.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let registration = state.orchestrator.register_worker(&id, body.endpoint).await?;
    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registration.worker)))
}

#[derive(Deserialize)]
struct ListWorkersQuery {
    status: Option<String>,
}

async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<ListWorkersQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = parse_status::<WorkerStatus>(query.status.as_deref())?;
    Ok(Json(state.orchestrator.list_workers(status).await?))
}

async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.get_worker(&id).await?))
}

async fn delete_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_worker(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.heartbeat(&id).await?))
}

async fn current_assignment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<axum::response::Response> {
    Ok(match state.orchestrator.current_assignment(&id).await? {
        Some(assignment) => Json(assignment).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[derive(Deserialize)]
struct CompleteRequest {
    job_id: String,
    #[serde(default)]
    result: serde_json::Value,
}

async fn report_completion(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult<impl IntoResponse> {
    let job = state
        .orchestrator
        .report_completion(&id, &body.job_id, body.result)
        .await?;
    Ok(Json(job))
}

#[derive(Deserialize)]
struct FailRequest {
    job_id: String,
    error: String,
}

async fn report_failure(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FailRequest>,
) -> ApiResult<impl IntoResponse> {
    let job = state
        .orchestrator
        .report_failure(&id, &body.job_id, &body.error)
        .await?;
    Ok(Json(job))
}

async fn reset_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.reset_worker(&id).await?))
}

async fn terminate_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.terminate_worker(&id).await?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::NullChannel;
    use crate::store::{Database, LibSqlBackend};

    async fn app() -> Router {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), db, Arc::new(NullChannel));
        routes(Arc::new(orchestrator))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_then_resubmit() {
        let app = app().await;
        let body = serde_json::json!({"idempotency_key": "k1", "task": {"n": 1}});

        let first = app.clone().oneshot(post_json("/api/jobs", body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = app.oneshot(post_json("/api/jobs", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reregistering_live_worker_is_200() {
        let app = app().await;
        let body = serde_json::json!({"id": "w1"});

        let first = app
            .clone()
            .oneshot(post_json("/api/workers", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = app.oneshot(post_json("/api/workers", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let response = app()
            .await
            .oneshot(Request::get("/api/jobs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_status_filter_is_400() {
        let response = app()
            .await
            .oneshot(
                Request::get("/api/workers?status=sleeping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn idle_worker_has_no_assignment() {
        let app = app().await;
        let created = app
            .clone()
            .oneshot(post_json("/api/workers", serde_json::json!({"id": "w1"})))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::get("/api/workers/w1/assignment")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
