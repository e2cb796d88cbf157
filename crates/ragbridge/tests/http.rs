//! HTTP routes backed by a scripted worker.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ragbridge::transport::http::{AppState, routes};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{bridge, next_worker};

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn chat_relays_worker_reply_and_sources() {
    let (bridge, _spawner, mut workers) = bridge();
    let app = routes(AppState::new(bridge.clone()));

    let request = tokio::spawn(app.clone().oneshot(post_json(
        "/chat",
        json!({
            "message": "Which careers fit an artistic profile?",
            "chat_history": [{"role": "user", "content": "hi"}, {"role": "assistant", "content": "hello"}],
            "language": "en"
        }),
    )));

    let mut worker = next_worker(&mut workers).await;
    worker.answer_initialize().await;
    let command = worker.expect_command("chat").await;
    assert_eq!(command["chat_history"][1]["role"], "assistant");
    worker
        .reply(json!({
            "id": command["id"],
            "status": "success",
            "data": {
                "response": "Graphic designer is a good fit.",
                "sources": [{"title": "Graphic Designers", "chunk_index": 3, "snippet": "Create visual concepts"}]
            }
        }))
        .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["response"], "Graphic designer is a good fit.");
    assert_eq!(body["sources"][0]["title"], "Graphic Designers");
    assert!(body.get("error").is_none());

    let health = app
        .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let health = response_json(health).await;
    assert_eq!(health["state"], "READY");
    assert_eq!(health["last_init"]["status"], "succeeded");

    bridge.shutdown();
}

#[tokio::test]
async fn greeting_worker_error_serves_fallback_with_detail() {
    let (bridge, _spawner, mut workers) = bridge();
    let app = routes(AppState::new(bridge.clone()));

    let request = tokio::spawn(app.oneshot(post_json(
        "/greeting",
        json!({"assessment_summary": "Top RIASEC codes: S, E"}),
    )));

    let mut worker = next_worker(&mut workers).await;
    worker.answer_initialize().await;
    let command = worker.expect_command("greeting").await;
    worker
        .reply(json!({
            "id": command["id"],
            "status": "error",
            "message": "LLM quota exceeded"
        }))
        .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response_json(response).await;
    assert_eq!(body["response"], ragbridge::transport::http::routes::GREETING_FALLBACK);
    assert!(body["error"].as_str().unwrap().contains("LLM quota exceeded"));

    bridge.shutdown();
}
