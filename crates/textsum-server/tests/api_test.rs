//! Router tests driven through `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use textsum_models::fixtures::{write_base_checkpoint, DIALOGUE_WORDS};
use textsum_models::{GenerationParams, MockModel, ModelError, Seq2SeqModel, TextTokenizer};
use textsum_server::{build_router, AppState, ModelState, ServerConfig};
use textsum_training::{job_runner, PipelineError, PredictionPipeline, TrainingQueue};
use tower::ServiceExt;

fn idle_queue() -> Arc<TrainingQueue> {
    Arc::new(TrainingQueue::start(job_runner(|_, _| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    })))
}

fn app(state: &AppState) -> Router {
    build_router(state.clone(), &ServerConfig::default())
}

fn mock_pipeline() -> PredictionPipeline {
    let temp = TempDir::new().unwrap();
    write_base_checkpoint(temp.path(), DIALOGUE_WORDS).unwrap();
    let tokenizer = TextTokenizer::from_dir(temp.path()).unwrap();
    PredictionPipeline::new(Arc::new(MockModel::new("mock", 3)), tokenizer)
}

/// Takes longer than any test timeout to produce a summary.
struct SlowModel;

impl Seq2SeqModel for SlowModel {
    fn id(&self) -> &str {
        "slow"
    }

    fn generate(&self, input_ids: &[u32], _: &[u32], _: &GenerationParams) -> Result<Vec<u32>, ModelError> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(input_ids.to_vec())
    }
}

async fn ready_state() -> AppState {
    let state = AppState::new(idle_queue(), 2);
    state.set_model_state(ModelState::Ready(Arc::new(mock_pipeline()))).await;
    state
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    (status, value)
}

#[tokio::test]
async fn test_health_before_model_loads() {
    let state = AppState::new(idle_queue(), 1);
    let (status, body) = send(app(&state), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy"}));

    let (status, body) = send(app(&state), Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "loading");
}

#[tokio::test]
async fn test_root_redirects_to_docs() {
    let state = AppState::new(idle_queue(), 1);
    let response = app(&state).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
    assert!(response.status().is_redirection());
    assert_eq!(response.headers()["location"], "/docs");
}

#[tokio::test]
async fn test_predict_returns_summary() {
    let state = ready_state().await;
    let (status, body) =
        send(app(&state), Method::POST, "/predict", Some(json!({"text": "amanda: i baked cookies"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"dialogue": "amanda: i baked cookies", "summary": "amanda: i"}));
}

#[tokio::test]
async fn test_predict_rejects_blank_text() {
    let state = ready_state().await;
    for payload in [json!({"text": "   "}), json!({})] {
        let (status, body) = send(app(&state), Method::POST, "/predict", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Text cannot be empty"}));
    }
}

#[tokio::test]
async fn test_predict_rejects_malformed_json() {
    let state = ready_state().await;
    let request = Request::post("/predict")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app(&state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_predict_unavailable_until_model_loads() {
    let state = AppState::new(idle_queue(), 1);
    let (status, body) = send(app(&state), Method::POST, "/predict", Some(json!({"text": "hello"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, json!({"error": "Model is still loading"}));
}

#[tokio::test]
async fn test_failed_loader_reported() {
    let state = AppState::new(idle_queue(), 1);
    state
        .spawn_model_loader(async { Err(PipelineError::Artifact("adapter missing".to_string())) })
        .await
        .unwrap();

    let (status, body) = send(app(&state), Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "failed");

    let (status, body) = send(app(&state), Method::POST, "/predict", Some(json!({"text": "hello"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().starts_with("Model failed to load"));
}

#[tokio::test]
async fn test_loader_makes_model_ready() {
    let state = AppState::new(idle_queue(), 1);
    state.spawn_model_loader(async { Ok(mock_pipeline()) }).await.unwrap();

    let (status, body) = send(app(&state), Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ready"}));
}

#[tokio::test]
async fn test_train_submit_status_and_cancel() {
    let state = ready_state().await;
    let (status, body) = send(app(&state), Method::POST, "/train", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Training started in background");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(app(&state), Method::GET, &format!("/train/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], job_id);
    assert!(matches!(body["status"]["state"].as_str(), Some("queued" | "running")));

    let (status, body) = send(app(&state), Method::DELETE, &format!("/train/{job_id}"), None).await;
    assert!(status == StatusCode::OK || status == StatusCode::ACCEPTED);
    assert!(matches!(body["status"].as_str(), Some("cancelled" | "cancelling")));

    let (status, body) = send(app(&state), Method::GET, "/train", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_finished_job_cannot_be_cancelled() {
    let queue = Arc::new(TrainingQueue::start(job_runner(|_, _| async { Ok(()) })));
    let state = AppState::new(Arc::clone(&queue), 1);
    let (_, body) = send(app(&state), Method::POST, "/train", None).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    for _ in 0..100 {
        let (_, body) = send(app(&state), Method::GET, &format!("/train/{job_id}"), None).await;
        if body["status"]["state"] == "succeeded" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, body) = send(app(&state), Method::DELETE, &format!("/train/{job_id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already finished"));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let state = AppState::new(idle_queue(), 1);
    let (status, body) = send(app(&state), Method::GET, "/train/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Unknown job nope"}));

    let (status, _) = send(app(&state), Method::DELETE, "/train/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_timeout_returns_json_error() {
    let temp = TempDir::new().unwrap();
    write_base_checkpoint(temp.path(), DIALOGUE_WORDS).unwrap();
    let tokenizer = TextTokenizer::from_dir(temp.path()).unwrap();
    let state = AppState::new(idle_queue(), 1);
    state.set_model_state(ModelState::Ready(Arc::new(PredictionPipeline::new(Arc::new(SlowModel), tokenizer)))).await;

    let config = ServerConfig { request_timeout: Duration::from_millis(50), ..ServerConfig::default() };
    let router = build_router(state, &config);
    let (status, body) = send(router, Method::POST, "/predict", Some(json!({"text": "amanda: i baked cookies"}))).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body, json!({"error": "Request timed out"}));
}
