mod common;

use std::sync::Arc;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use reqwest::StatusCode as HttpStatus;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::TestServer;
use user_api::config::AppConfig;
use user_api::database::MemoryModel;
use user_api::models::user;

fn router(config: &AppConfig) -> axum::Router {
    user_api::app(Arc::new(MemoryModel::new(user::schema())), config)
}

async fn json_body(response: axum::response::Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn root_and_health() -> Result<()> {
    let server = TestServer::spawn().await?;

    let text = server.client.get(server.url("/")).send().await?.text().await?;
    assert_eq!(text, "Welcome to the API");

    let (status, body) = server.get("/health").await?;
    assert_eq!(status, HttpStatus::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["data"]["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn unmatched_route_names_the_original_url() -> Result<()> {
    let server = TestServer::spawn().await?;

    let (status, body) = server.get("/api/nothing?x=1").await?;
    assert_eq!(status, HttpStatus::NOT_FOUND);
    assert_eq!(body, json!({"status": "fail", "message": "Cannot find /api/nothing?x=1 on this server"}));
    Ok(())
}

#[tokio::test]
async fn security_headers_are_sent() -> Result<()> {
    let response = router(&AppConfig::test())
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
    assert_eq!(headers["x-dns-prefetch-control"], "off");
    assert!(headers.contains_key("strict-transport-security"));
    assert!(headers.contains_key("content-security-policy"));
    Ok(())
}

#[tokio::test]
async fn rate_limit_rejects_excess_requests() -> Result<()> {
    let mut config = AppConfig::test();
    config.api.enable_rate_limiting = true;
    config.api.rate_limit_requests = 2;
    let app = router(&config);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("ratelimit-remaining"));
    }

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["ratelimit-remaining"], "0");
    assert_eq!(
        json_body(response).await?,
        json!({"status": "fail", "message": "Too many requests, please try again later."})
    );
    Ok(())
}

#[tokio::test]
async fn oversized_bodies_are_rejected() -> Result<()> {
    let mut config = AppConfig::test();
    config.api.max_request_size_bytes = 64;
    let payload = json!({"name": "A".repeat(100), "email": "a@example.com", "password": "secret123"});

    let response = router(&config)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/users")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    Ok(())
}

#[tokio::test]
async fn operator_keys_are_stripped_from_bodies() -> Result<()> {
    let app = router(&AppConfig::test());
    let payload = json!({
        "name": "Ann",
        "email": "ann@example.com",
        "password": "secret123",
        "$where": "1 == 1",
    });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/users")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await?;
    assert!(body["data"].get("$where").is_none());

    // `$`-prefixed query keys never reach the filter
    let response = app
        .oneshot(Request::builder().uri("/api/users?$where=x").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await?["results"], 1);
    Ok(())
}

#[tokio::test]
async fn cors_allows_configured_origins() -> Result<()> {
    let response = router(&AppConfig::test())
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("origin", "http://localhost:8080")
                .body(Body::empty())?,
        )
        .await?;
    assert!(response.headers().contains_key("access-control-allow-origin"));
    Ok(())
}
