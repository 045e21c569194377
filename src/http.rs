//! The external control surface: job submission, progress/result lookup,
//! listener registration, health. A thin `axum` projection over [`Mlq`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::job::JobProgress;
use crate::queue::Mlq;

pub fn router(mlq: Mlq) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/jobs", post(submit_job))
        .route("/jobs/count", get(job_count))
        .route("/jobs/:id/progress", get(get_progress))
        .route("/jobs/:id/short_result", get(get_short_result))
        .route("/jobs/:id/result", get(get_result))
        .route("/consumer", post(activate_consumer))
        .route("/consumer", delete(deactivate_consumer))
        .with_state(mlq)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct SubmitRequest {
    msg: Value,
    #[serde(default)]
    callback: Option<String>,
    #[serde(default)]
    functions: Option<Vec<String>>,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: String,
}

async fn submit_job(State(mlq): State<Mlq>, Json(body): Json<SubmitRequest>) -> impl IntoResponse {
    match mlq.post(body.msg, body.callback, body.functions).await {
        Ok(id) => (StatusCode::OK, Json(SubmitResponse { id })).into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

async fn job_count(State(mlq): State<Mlq>) -> impl IntoResponse {
    match mlq.job_count().await {
        Ok(n) => (StatusCode::OK, n.to_string()),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

async fn get_progress(State(mlq): State<Mlq>, Path(id): Path<String>) -> impl IntoResponse {
    match mlq.progress(&id).await {
        Ok(Some(record)) => (StatusCode::OK, JobProgress::from(record.progress).to_string()),
        Ok(None) => (StatusCode::NOT_FOUND, "not found".to_string()),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

async fn get_short_result(State(mlq): State<Mlq>, Path(id): Path<String>) -> impl IntoResponse {
    match mlq.progress(&id).await {
        Ok(Some(record)) => (StatusCode::OK, record.short_result.unwrap_or_else(|| "[no result]".to_string())),
        Ok(None) => (StatusCode::NOT_FOUND, "not found".to_string()),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

/// Returns `result` as JSON, falling back to the text/byte-key codec
/// tolerance for records that failed a clean text-mode decode upstream.
async fn get_result(State(mlq): State<Mlq>, Path(id): Path<String>) -> impl IntoResponse {
    let key = mlq.namespace().progress_key(&id);
    match mlq.get_raw(&key).await {
        Ok(Some(bytes)) => match codec::decode(&bytes, &key) {
            Ok(record) => match record.result {
                Some(value) => (StatusCode::OK, Json(value)).into_response(),
                None => (StatusCode::OK, "[no result]".to_string()).into_response(),
            },
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "[corrupt record]".to_string()).into_response(),
        },
        Ok(None) => (StatusCode::NOT_FOUND, "not found".to_string()).into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct ConsumerRequest {
    name: String,
}

async fn activate_consumer(State(mlq): State<Mlq>, Json(body): Json<ConsumerRequest>) -> impl IntoResponse {
    let activated = mlq.activate_listener(&body.name).await;
    (StatusCode::OK, activated.to_string())
}

async fn deactivate_consumer(State(mlq): State<Mlq>, Json(body): Json<ConsumerRequest>) -> impl IntoResponse {
    let removed = mlq.remove_listener(&body.name).await;
    (StatusCode::OK, removed.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::fake::FakeStore;
    use crate::store::Store;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn submit_then_query_progress() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let mlq = Mlq::new("ns", store);
        let app = router(mlq);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"msg": "hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/jobs/1/progress").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
