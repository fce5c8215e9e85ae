mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

#[tokio::test]
async fn v1_routes_require_bearer_auth() {
    let state = helpers::offline_state();

    let paths = [
        "/v1/projects",
        "/v1/projects/acme/services",
        "/v1/projects/acme/addons",
    ];

    for path in paths {
        let app = helpers::router(state.clone());
        let response = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{path}");
    }
}

#[tokio::test]
async fn empty_bearer_is_rejected() {
    let app = helpers::router(helpers::offline_state());

    let response = app
        .oneshot(
            Request::get("/v1/projects")
                .header("authorization", "Bearer ")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_poll_requires_auth() {
    let app = helpers::router(helpers::offline_state());

    let response = app
        .oneshot(
            Request::get(
                "/v1/services/7e2f9f5a-8e4e-4f0a-9c7b-1d2e3f4a5b6c/builds/deadbeefcafe/status",
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
