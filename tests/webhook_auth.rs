mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::util::ServiceExt;

fn github_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn push_payload() -> Vec<u8> {
    serde_json::json!({
        "ref": "refs/heads/main",
        "after": "1f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c",
        "repository": {"clone_url": "https://github.com/acme/api.git"},
        "pusher": {"name": "aldo"},
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn unsigned_delivery_is_rejected() {
    let app = helpers::router(helpers::offline_state());

    let response = app
        .oneshot(
            Request::post("/webhooks/github")
                .header("content-type", "application/json")
                .header("x-github-delivery", "d-1")
                .header("x-github-event", "push")
                .body(Body::from(push_payload()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let app = helpers::router(helpers::offline_state());
    let body = push_payload();
    let signature = github_signature("not-the-secret", &body);

    let response = app
        .oneshot(
            Request::post("/webhooks/github")
                .header("content-type", "application/json")
                .header("x-github-delivery", "d-2")
                .header("x-github-event", "push")
                .header("x-hub-signature-256", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tampered_body_is_rejected() {
    let app = helpers::router(helpers::offline_state());
    let signature = github_signature("gh-secret", &push_payload());

    let response = app
        .oneshot(
            Request::post("/webhooks/github")
                .header("x-github-delivery", "d-3")
                .header("x-github-event", "push")
                .header("x-hub-signature-256", signature)
                .body(Body::from(r#"{"ref": "refs/heads/evil"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_forge_is_not_found() {
    let app = helpers::router(helpers::offline_state());

    let response = app
        .oneshot(
            Request::post("/webhooks/sourcehut")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_delivery_id_is_bad_request() {
    let app = helpers::router(helpers::offline_state());
    let body = push_payload();
    let signature = github_signature("gh-secret", &body);

    let response = app
        .oneshot(
            Request::post("/webhooks/github")
                .header("x-github-event", "push")
                .header("x-hub-signature-256", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// A correctly signed delivery passes authentication and reaches the store;
/// with the store unreachable the ingestor answers 503 so the forge retries
/// and no event is lost.
#[tokio::test]
async fn signed_delivery_with_store_down_returns_503() {
    let app = helpers::router(helpers::offline_state());
    let body = push_payload();
    let signature = github_signature("gh-secret", &body);

    let response = app
        .oneshot(
            Request::post("/webhooks/github")
                .header("x-github-delivery", "d-4")
                .header("x-github-event", "push")
                .header("x-hub-signature-256", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn gitlab_token_header_is_verified() {
    let app = helpers::router(helpers::offline_state());

    let response = app
        .oneshot(
            Request::post("/webhooks/gitlab")
                .header("x-gitlab-event-uuid", "d-5")
                .header("x-gitlab-event", "Push Hook")
                .header("x-gitlab-token", "wrong")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
