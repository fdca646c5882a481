//! HTTP surface: webhook intake, job lookup, health and operator endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use berth_core::{LineId, PipelineMode};
use berth_store::Store;
use berth_sync::{IntakeError, WebhookIntake};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "berth-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub intake: WebhookIntake,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            intake: WebhookIntake::new(store.clone()),
            store,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/line-pricing", post(webhook_handler))
        .route("/jobs/{id}", get(job_handler))
        .route("/admin/pause", post(pause_handler))
        .route("/admin/resume", post(resume_handler))
        .route("/admin/locks/{line_id}", delete(clear_lock_handler))
        .route("/admin/lines/{line_id}/sync", post(line_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Accepts `lineId` or `lineid`, as a number or a numeric string.
fn line_id_from_body(body: &JsonValue) -> Option<i64> {
    let raw = body.get("lineId").or_else(|| body.get("lineid"))?;
    match raw {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn enqueue(state: &AppState, raw_line_id: i64) -> Response {
    match state.intake.receive_event(raw_line_id).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "jobId": job_id })),
        )
            .into_response(),
        Err(err @ IntakeError::InvalidLineId(_)) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        Err(IntakeError::Persist(err)) => server_error(err),
    }
}

async fn webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Ok(body) = serde_json::from_slice::<JsonValue>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "body must be a JSON object");
    };
    let Some(raw_line_id) = line_id_from_body(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "lineId must be a positive integer");
    };
    enqueue(&state, raw_line_id).await
}

async fn job_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "job id must be a UUID");
    };
    match state.store.job(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("job {id} not found")),
        Err(err) => server_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.mode().await {
        Ok(record) => Json(json!({ "status": "ok", "mode": record.mode.as_str() })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ModeQuery {
    reason: Option<String>,
}

async fn set_mode(state: &AppState, mode: PipelineMode, reason: Option<&str>) -> Response {
    match state.store.set_mode(mode, reason).await {
        Ok(record) => {
            info!(mode = mode.as_str(), reason = reason.unwrap_or("-"), "pipeline mode changed");
            Json(record).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn pause_handler(State(state): State<Arc<AppState>>, Query(query): Query<ModeQuery>) -> Response {
    set_mode(&state, PipelineMode::Paused, query.reason.as_deref()).await
}

async fn resume_handler(State(state): State<Arc<AppState>>, Query(query): Query<ModeQuery>) -> Response {
    set_mode(&state, PipelineMode::Active, query.reason.as_deref()).await
}

async fn clear_lock_handler(State(state): State<Arc<AppState>>, Path(line_id): Path<i64>) -> Response {
    let Some(line_id) = LineId::new(line_id) else {
        return error_response(StatusCode::BAD_REQUEST, "line id must be a positive integer");
    };
    match state.store.force_clear(line_id).await {
        Ok(cleared) => {
            info!(line_id = %line_id, cleared, "line lock cleared by operator");
            Json(json!({ "lineId": line_id, "cleared": cleared })).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn line_sync_handler(State(state): State<Arc<AppState>>, Path(line_id): Path<i64>) -> Response {
    enqueue(&state, line_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use berth_core::JobStatus;
    use berth_store::{LineLocks, MemoryStore, ModeStore};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn setup() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::default());
        (store.clone(), app(AppState::new(store)))
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn webhook_queues_job_and_job_is_visible() {
        let (store, app) = setup();
        let resp = app
            .clone()
            .oneshot(post_json("/webhooks/line-pricing", r#"{"lineId": 16}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "queued");
        let job_id = body["jobId"].as_str().unwrap().to_string();
        assert_eq!(store.jobs().len(), 1);

        let resp = app
            .oneshot(Request::builder().uri(format!("/jobs/{job_id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let job = body_json(resp).await;
        assert_eq!(job["line_id"], 16);
        assert_eq!(job["status"], JobStatus::Pending.as_str());
    }

    #[tokio::test]
    async fn webhook_accepts_lowercase_key_and_string_ids() {
        let (store, app) = setup();
        let resp = app
            .oneshot(post_json("/webhooks/line-pricing", r#"{"lineid": "21"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(store.jobs()[0].line_id.get(), 21);
    }

    #[tokio::test]
    async fn webhook_rejects_invalid_line_ids() {
        let (store, app) = setup();
        for body in [r#"{"lineId": 0}"#, r#"{"lineId": -3}"#, r#"{"lineId": "abc"}"#, r#"{}"#, "not json"] {
            let resp = app
                .clone()
                .oneshot(post_json("/webhooks/line-pricing", body))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body}");
        }
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (_, app) = setup();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pause_and_resume_are_reflected_in_health() {
        let (store, app) = setup();
        let resp = app
            .clone()
            .oneshot(post_json("/admin/pause?reason=deploy", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.mode().await.unwrap().reason.as_deref(), Some("deploy"));

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(health).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "paused");

        // Pausing twice is harmless.
        let again = app.clone().oneshot(post_json("/admin/pause", "")).await.unwrap();
        assert_eq!(again.status(), StatusCode::OK);

        let resp = app.oneshot(post_json("/admin/resume", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.mode().await.unwrap().mode, PipelineMode::Active);
    }

    #[tokio::test]
    async fn clear_lock_drops_any_holder() {
        let (store, app) = setup();
        let line = LineId::new(16).unwrap();
        store.try_acquire(line, "crashed-worker", Duration::from_secs(60)).await.unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/locks/16")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["cleared"], true);
        assert_eq!(store.lock_owner(line), None);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/locks/16")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["cleared"], false);
    }

    #[tokio::test]
    async fn operator_line_sync_enqueues_like_a_webhook() {
        let (store, app) = setup();
        let resp = app.clone().oneshot(post_json("/admin/lines/16/sync", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(store.jobs().len(), 1);

        let resp = app.oneshot(post_json("/admin/lines/0/sync", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
