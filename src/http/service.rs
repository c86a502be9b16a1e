//! Admission service endpoints.
//!
//! Lets components that cannot embed the middleware ask for a decision over
//! HTTP, in the spirit of an external rate limit service:
//!
//! - `POST /v1/check` charges one request and returns the decision
//! - `GET /v1/policy` returns the enforced policy table
//! - `GET /health` pings the counter store

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use super::middleware::{apply_headers, Rejection};
use super::ApiError;
use crate::ratelimit::{Category, RateLimiterBackend};

/// Body of `POST /v1/check`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub client_id: String,
    pub category: String,
}

/// Build the admission service router.
pub fn router(limiter: Arc<dyn RateLimiterBackend>) -> Router {
    Router::new()
        .route("/v1/check", post(check))
        .route("/v1/policy", get(policy))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(limiter)
}

/// Decide whether a request may proceed.
#[instrument(
    skip(limiter, request),
    fields(client_id = %request.client_id, category = %request.category)
)]
async fn check(
    State(limiter): State<Arc<dyn RateLimiterBackend>>,
    Json(request): Json<CheckRequest>,
) -> Response {
    if request.client_id.trim().is_empty() {
        warn!("Received check request with empty client id");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Bad Request",
                "message": "clientId is required",
            })),
        )
            .into_response();
    }

    let category = Category::new(&request.category);
    match limiter.check_and_consume(request.client_id.trim(), &category).await {
        Ok(decision) if decision.allowed => {
            info!(degraded = decision.is_degraded(), "Request admitted");
            let mut response = Json(&decision).into_response();
            apply_headers(response.headers_mut(), &decision);
            response
        }
        Ok(decision) => {
            info!(window = ?decision.window, "Request rejected");
            Rejection::from(&decision).into_response()
        }
        Err(err) => ApiError(err).into_response(),
    }
}

async fn policy(State(limiter): State<Arc<dyn RateLimiterBackend>>) -> Response {
    Json(limiter.policy()).into_response()
}

async fn health(State(limiter): State<Arc<dyn RateLimiterBackend>>) -> Response {
    match limiter.health().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateLimitPolicy, RateLimiter};
    use crate::store::MemoryCounterStore;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(RateLimiter::new(
            Arc::new(RateLimitPolicy::canonical()),
            Arc::new(MemoryCounterStore::new()),
        )))
    }

    fn check_request(body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/v1/check")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_allows_and_reports_remaining() {
        let response = app()
            .oneshot(check_request(json!({ "clientId": "c1", "category": "data" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-category"], "data");

        let json = body_json(response).await;
        assert_eq!(json["allowed"], true);
        assert_eq!(json["remaining"]["second"], 9);
        assert_eq!(json["remaining"]["day"], 4);
        assert_eq!(json["costs"]["hour"], 5000);
    }

    #[tokio::test]
    async fn test_check_unknown_category_is_bad_request() {
        let response = app()
            .oneshot(check_request(json!({ "clientId": "c1", "category": "margin" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Unknown Category");
    }

    #[tokio::test]
    async fn test_check_empty_client_rejected() {
        let response = app()
            .oneshot(check_request(json!({ "clientId": "  ", "category": "quote" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_policy_endpoint() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/policy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["categories"]["order"]["day"]["limit"], 35000);
        assert_eq!(json["categories"]["quote"]["hour"], "unlimited");
    }

    #[tokio::test]
    async fn test_health_ok() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }
}
