//! Webhook requests through the listener router

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use common::{harness, Harness};
use serde_json::{json, Value};
use tower::ServiceExt;
use wireflow::store::{RunStatus, TriggerKind};
use wireflow::trigger::auth::sign;
use wireflow::{Edge, Node, NodeKind};

async fn armed_hook(h: &Harness, config: Value) -> String {
    h.save(
        "echo",
        vec![
            Node::new("hook", NodeKind::WebhookTrigger, json!({})),
            Node::new("out", NodeKind::Output, json!({})),
        ],
        vec![Edge::new("hook", "out").from_handle("body")],
    )
    .await;
    let trigger = h.triggers.create("echo", TriggerKind::Webhook, config).await.unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();
    trigger.id
}

async fn send(h: &Harness, request: Request<Body>) -> Response {
    h.triggers.webhook_router().oneshot(request).await.unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn accepted_request_starts_a_run() {
    let h = harness();
    let trigger_id = armed_hook(&h, json!({"path": "orders"})).await;

    let response = send(&h, post("/hook/orders?source=test", r#"{"order": 7}"#)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["status"], "accepted");
    let run_id = body["runId"].as_str().unwrap().to_string();

    let run = h.finished_run(&run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.trigger_id.as_deref(), Some(trigger_id.as_str()));
    assert_eq!(run.output, Some(json!({"order": 7})));

    let trigger = h.triggers.get(&trigger_id).await.unwrap();
    assert_eq!(trigger.fire_count, 1);
    assert!(trigger.last_fired.is_some());
}

#[tokio::test]
async fn wait_mode_returns_the_run_output() {
    let h = harness();
    armed_hook(&h, json!({"path": "sync", "responseMode": "wait"})).await;

    let response = send(&h, post("/hook/sync", r#"{"ping": "pong"}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"], json!({"ping": "pong"}));
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let h = harness();
    armed_hook(&h, json!({"path": "orders"})).await;

    let response = send(&h, post("/hook/missing", "{}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disallowed_method_is_rejected() {
    let h = harness();
    armed_hook(&h, json!({"path": "orders"})).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/hook/orders")
        .body(Body::empty())
        .unwrap();
    let response = send(&h, request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn bearer_token_is_checked() {
    let h = harness();
    armed_hook(&h, json!({"path": "secure", "authMode": "token", "secret": "s3cret"})).await;

    let response = send(&h, post("/hook/secure", "{}")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut wrong = post("/hook/secure", "{}");
    wrong.headers_mut().insert("authorization", "Bearer nope".parse().unwrap());
    assert_eq!(send(&h, wrong).await.status(), StatusCode::UNAUTHORIZED);

    let mut right = post("/hook/secure", "{}");
    right.headers_mut().insert("authorization", "Bearer s3cret".parse().unwrap());
    assert_eq!(send(&h, right).await.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn hmac_signature_covers_the_raw_body() {
    let h = harness();
    armed_hook(&h, json!({"path": "signed", "authMode": "hmac", "secret": "key"})).await;
    let body = r#"{"amount": 10}"#;

    let mut tampered = post("/hook/signed", r#"{"amount": 99}"#);
    tampered
        .headers_mut()
        .insert("x-signature", format!("sha256={}", sign("key", body.as_bytes())).parse().unwrap());
    assert_eq!(send(&h, tampered).await.status(), StatusCode::UNAUTHORIZED);

    let mut signed = post("/hook/signed", body);
    signed
        .headers_mut()
        .insert("x-signature", format!("sha256={}", sign("key", body.as_bytes())).parse().unwrap());
    assert_eq!(send(&h, signed).await.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn requests_over_the_limit_get_429() {
    let h = harness();
    armed_hook(&h, json!({"path": "burst", "maxPerMinute": 2})).await;

    assert_eq!(send(&h, post("/hook/burst", "{}")).await.status(), StatusCode::ACCEPTED);
    assert_eq!(send(&h, post("/hook/burst", "{}")).await.status(), StatusCode::ACCEPTED);
    assert_eq!(send(&h, post("/hook/burst", "{}")).await.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn disarmed_hook_stops_answering() {
    let h = harness();
    let trigger_id = armed_hook(&h, json!({"path": "orders"})).await;
    h.triggers.disarm(&trigger_id).await.unwrap();

    assert_eq!(send(&h, post("/hook/orders", "{}")).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wait_mode_gives_up_after_the_route_timeout() {
    let h = harness();
    h.save(
        "slow",
        vec![
            Node::new("hook", NodeKind::WebhookTrigger, json!({})),
            Node::new("nap", NodeKind::ShellExec, json!({"command": "sleep 3", "timeoutSecs": 10})),
            Node::new("out", NodeKind::Output, json!({})),
        ],
        vec![Edge::new("hook", "nap"), Edge::new("nap", "out").from_handle("stdout")],
    )
    .await;
    let trigger = h
        .triggers
        .create("slow", TriggerKind::Webhook, json!({"path": "slow", "responseMode": "wait", "timeoutSecs": 1}))
        .await
        .unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();

    let started = std::time::Instant::now();
    let response = send(&h, post("/hook/slow", "{}")).await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(started.elapsed() < std::time::Duration::from_secs(3));
}
