#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use anyhow::ensure;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, StatusCode, header},
};
use common::{PASSWORD, USERNAME, stack};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "admin-s3cret";

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.expect("infallible router")
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn login_body(password: &str) -> Value {
    json!({
        "method": "password",
        "credentials": {"username": USERNAME, "password": password}
    })
}

#[tokio::test]
async fn login_then_verify_over_http() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;
    let app = authn::api::app(&stack.state(None));

    let response = send(&app, post_json("/v1/auth/login", &login_body(PASSWORD))).await;
    assert_eq!(response.status(), StatusCode::OK);
    ensure!(response.headers().contains_key("x-request-id"));
    let login = json_body(response).await;
    assert_eq!(login["tokenType"], "Bearer");
    assert_eq!(login["expiresIn"], 900);

    let access_token = login["accessToken"].as_str().expect("accessToken");
    let response = send(
        &app,
        post_json("/v1/auth/verify", &json!({"accessToken": access_token})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let verified = json_body(response).await;
    assert_eq!(verified["valid"], true);
    assert_eq!(verified["claims"]["userId"], common::USER_ID);
    Ok(())
}

#[tokio::test]
async fn failed_login_renders_error_envelope() {
    let stack = stack().await;
    stack.register().await;
    let app = authn::api::app(&stack.state(None));

    let response = send(&app, post_json("/v1/auth/login", &login_body("wrong"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert!(body["code"].is_u64());
    assert_eq!(body["message"], "invalid username or password");

    let response = send(&app, post_json("/v1/auth/login", &json!({"method": "sms"}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn request_id_is_propagated() {
    let stack = stack().await;
    let app = authn::api::app(&stack.state(None));

    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .expect("request");
    let response = send(&app, request).await;
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok()),
        Some("req-123")
    );
}

#[tokio::test]
async fn jwks_honours_if_none_match() -> anyhow::Result<()> {
    let stack = stack().await;
    let app = authn::api::app(&stack.state(None));

    let response = send(&app, get("/.well-known/jwks.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .expect("etag");
    ensure!(response.headers().contains_key(header::LAST_MODIFIED));
    assert_eq!(
        response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok()),
        Some("public, max-age=300")
    );
    let jwks = json_body(response).await;
    assert_eq!(jwks["keys"].as_array().map(Vec::len), Some(1));
    assert_eq!(jwks["keys"][0]["kty"], "EC");

    let request = Request::builder()
        .uri("/.well-known/jwks.json")
        .header(header::IF_NONE_MATCH, etag.as_str())
        .body(Body::empty())?;
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    Ok(())
}

#[tokio::test]
async fn health_reports_each_dependency() {
    let stack = stack().await;
    let app = authn::api::app(&stack.state(None));

    let response = send(&app, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-app"));
    let health = json_body(response).await;
    assert_eq!(health["name"], "authn");
    assert_eq!(health["database"], "ok");
    assert_eq!(health["tokenStore"], "ok");
    assert_eq!(health["signingKey"], "ok");
}

#[tokio::test]
async fn admin_routes_need_a_configured_token() -> anyhow::Result<()> {
    let stack = stack().await;

    let app = authn::api::app(&stack.state(None));
    let response = send(&app, get("/v1/admin/keys")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let app = authn::api::app(&stack.state(Some(ADMIN_TOKEN)));
    let response = send(&app, get("/v1/admin/keys")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/v1/admin/keys")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())?;
    assert_eq!(send(&app, request).await.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/v1/admin/keys?status=active")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())?;
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let list = json_body(response).await;
    assert_eq!(list["total"], 1);
    Ok(())
}

#[tokio::test]
async fn admin_rotation_publishes_both_keys() -> anyhow::Result<()> {
    let stack = stack().await;
    let app = authn::api::app(&stack.state(Some(ADMIN_TOKEN)));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/admin/keys/rotate")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())?;
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let rotated = json_body(response).await;
    assert_eq!(rotated["status"], "active");

    let jwks = json_body(send(&app, get("/.well-known/jwks.json")).await).await;
    let kids: Vec<&str> = jwks["keys"]
        .as_array()
        .expect("keys")
        .iter()
        .filter_map(|key| key["kid"].as_str())
        .collect();
    assert_eq!(kids.len(), 2);
    ensure!(kids.contains(&rotated["kid"].as_str().expect("kid")));
    Ok(())
}
