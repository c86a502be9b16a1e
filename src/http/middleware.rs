//! Admission middleware: turns rate limiter decisions into HTTP responses.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use super::ApiError;
use crate::config::ServerConfig;
use crate::ratelimit::{Category, Decision, RateLimiterBackend, WindowKind};

const X_RATELIMIT_CATEGORY: HeaderName = HeaderName::from_static("x-ratelimit-category");
const X_RATELIMIT_COSTS: HeaderName = HeaderName::from_static("x-ratelimit-costs");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_DEGRADED: HeaderName = HeaderName::from_static("x-ratelimit-degraded");

/// State carried by one admission layer: the shared limiter and the category
/// charged for every request passing through it.
#[derive(Clone)]
pub struct AdmissionState {
    limiter: Arc<dyn RateLimiterBackend>,
    category: Category,
    trust_forwarded_for: bool,
}

impl AdmissionState {
    /// Account requests by peer address; `X-Forwarded-For` is ignored.
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, category: Category) -> Self {
        Self {
            limiter,
            category,
            trust_forwarded_for: false,
        }
    }

    /// Admission state following the server's proxy settings.
    pub fn from_config(
        limiter: Arc<dyn RateLimiterBackend>,
        category: Category,
        config: &ServerConfig,
    ) -> Self {
        Self::new(limiter, category).trust_forwarded_for(config.trust_forwarded_for)
    }

    /// Account requests by the first `X-Forwarded-For` hop when present.
    ///
    /// Only enable behind a proxy that overwrites the header, otherwise
    /// clients can pick their own identity.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Body of a `429 Too Many Requests` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub error: &'static str,
    pub message: Option<String>,
    pub category: Category,
    pub window: Option<WindowKind>,
    pub cost_per_request: Option<u64>,
    pub reset_time: Option<u64>,
}

impl From<&Decision> for Rejection {
    fn from(decision: &Decision) -> Self {
        Self {
            error: "Too Many Requests",
            message: decision.message.clone(),
            category: decision.category.clone(),
            window: decision.window,
            cost_per_request: decision.cost_per_request,
            reset_time: decision.reset_time,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let retry_after = self.reset_time;
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Wrap every route of `router` in an admission check for `category`.
pub fn admit<S>(router: Router<S>, limiter: Arc<dyn RateLimiterBackend>, category: Category) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    admit_with(router, AdmissionState::new(limiter, category))
}

/// Wrap every route of `router` in an admission check configured by `state`.
pub fn admit_with<S>(router: Router<S>, state: AdmissionState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(from_fn_with_state(state, admission_middleware))
}

/// Axum middleware enforcing the rate limit of the layer's category.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(&request, state.trust_forwarded_for);

    match state.limiter.check_and_consume(&client, &state.category).await {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &decision);
            response
        }
        Ok(decision) => {
            debug!(
                client_id = %client,
                category = %state.category,
                window = ?decision.window,
                "Request rejected"
            );
            Rejection::from(&decision).into_response()
        }
        Err(err) => ApiError(err).into_response(),
    }
}

/// Identity a request is accounted under.
///
/// Uses the first `X-Forwarded-For` hop when `trust_forwarded_for` is set,
/// then the peer address, then `unknown`.
pub fn client_id(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());

        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Attach rate limit metadata of an allowed decision.
pub(crate) fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    if let Ok(value) = HeaderValue::from_str(decision.category.as_str()) {
        headers.insert(X_RATELIMIT_CATEGORY, value);
    }
    if let Some(value) = json_header(&decision.costs) {
        headers.insert(X_RATELIMIT_COSTS, value);
    }
    if let Some(value) = json_header(&decision.remaining) {
        headers.insert(X_RATELIMIT_REMAINING, value);
    }
    if decision.is_degraded() {
        headers.insert(X_RATELIMIT_DEGRADED, HeaderValue::from_static("true"));
    }
}

fn json_header<T: Serialize>(value: &T) -> Option<HeaderValue> {
    serde_json::to_string(value)
        .ok()
        .and_then(|json| HeaderValue::from_str(&json).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, RateLimitPolicy, RateLimiter};
    use crate::store::MemoryCounterStore;
    use axum::body::Body;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    // 2024-01-01T00:00:00Z
    const START: u64 = 1_704_067_200;

    fn quote_limiter() -> Arc<dyn RateLimiterBackend> {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryCounterStore::with_clock(Arc::new(clock.clone())));
        Arc::new(RateLimiter::with_clock(
            Arc::new(RateLimitPolicy::canonical()),
            store,
            clock,
        ))
    }

    fn quote_app(trust_forwarded_for: bool) -> Router {
        let config = ServerConfig {
            trust_forwarded_for,
            ..ServerConfig::default()
        };
        admit_with(
            Router::new().route("/quotes/{symbol}", get(|| async { "quote" })),
            AdmissionState::from_config(quote_limiter(), Category::quote(), &config),
        )
    }

    fn quote_request(forwarded_for: &str, peer: [u8; 4]) -> axum::http::Request<Body> {
        let mut request = axum::http::Request::builder()
            .uri("/quotes/INFY")
            .header("x-forwarded-for", forwarded_for)
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
        request
    }

    #[test]
    fn test_client_id_from_forwarded_header_when_trusted() {
        let request = axum::http::Request::builder()
            .header("x-forwarded-for", " 203.0.113.9 , 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&request, true), "203.0.113.9");
        assert_eq!(client_id(&request, false), "unknown");
    }

    #[test]
    fn test_client_id_from_peer_address() {
        let mut request = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 50000))));
        assert_eq!(client_id(&request, false), "192.168.1.20");

        let bare = axum::http::Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_id(&bare, true), "unknown");
    }

    #[tokio::test]
    async fn test_allowed_request_gets_headers() {
        let app = quote_app(true);
        let response = app
            .oneshot(quote_request("198.51.100.1", [10, 0, 0, 1]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-category"], "quote");
        assert_eq!(headers["x-ratelimit-costs"], r#"{"second":1}"#);
        assert_eq!(
            headers["x-ratelimit-remaining"],
            r#"{"second":99,"minute":"unlimited","hour":"unlimited","day":"unlimited"}"#
        );
        assert!(headers.get("x-ratelimit-degraded").is_none());
    }

    #[tokio::test]
    async fn test_exhausted_quota_returns_429() {
        let app = quote_app(true);
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(quote_request("198.51.100.2", [10, 0, 0, 1]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(quote_request("198.51.100.2", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["category"], "quote");
        assert_eq!(json["window"], "second");
        assert_eq!(json["costPerRequest"], 1);
        assert_eq!(json["resetTime"], 1);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_header_is_ignored_by_default() {
        let app = quote_app(false);
        for i in 0..100 {
            let response = app
                .clone()
                .oneshot(quote_request(&format!("203.0.113.{i}"), [10, 0, 0, 7]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(quote_request("203.0.113.250", [10, 0, 0, 7]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
