use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{ConnectInfo, OriginalUri, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::debug;

use super::key::{ProxyTrust, default_key};
use super::{Decision, RateLimitPolicy, RateLimiter};

/// Custom bucket key. Receives the request and the resolved client IP.
pub type KeyFn = Arc<dyn Fn(&Request, &str) -> String + Send + Sync>;

/// Per-route-group limiter configuration handed to [`rate_limit`].
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
    suffix: Arc<str>,
    proxy: ProxyTrust,
    key_fn: Option<KeyFn>,
}

impl RateLimitGuard {
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>, policy: RateLimitPolicy, proxy: ProxyTrust) -> Self {
        Self {
            limiter,
            suffix: policy.key_suffix().into(),
            policy,
            proxy,
            key_fn: None,
        }
    }

    #[must_use]
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    fn bucket_key(&self, req: &Request) -> String {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip = self.proxy.client_ip(req.headers(), peer);

        let base = if let Some(key_fn) = &self.key_fn {
            key_fn(req, &ip)
        } else {
            let path = req
                .extensions()
                .get::<OriginalUri>()
                .map_or_else(|| req.uri().path(), |OriginalUri(uri)| uri.path());
            default_key(&ip, req.method(), path)
        };

        format!("{base}:{}", self.suffix)
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimitedBody {
    pub code: u16,
    pub message: &'static str,
    pub retry_after: u64,
}

/// With stacked guards the innermost one reports; outer guards leave its
/// headers alone.
fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    if headers.contains_key("x-ratelimit-limit") {
        return;
    }
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_seconds));
}

fn too_many_requests(decision: &Decision) -> Response {
    let body = RateLimitedBody {
        code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        message: "Too many requests, please try again later",
        retry_after: decision.reset_seconds,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert("retry-after", HeaderValue::from(decision.reset_seconds));
    response
}

pub async fn rate_limit(State(guard): State<RateLimitGuard>, req: Request, next: Next) -> Response {
    let key = guard.bucket_key(&req);
    let decision = guard.limiter.admit(&key, &guard.policy);

    let outcome = if decision.allowed { "allowed" } else { "denied" };
    metrics::counter!("rate_limit_decisions_total", "outcome" => outcome).increment(1);

    if !decision.allowed {
        debug!(
            event = "rate_limited",
            key = %key,
            retry_after = decision.reset_seconds,
            "Request rate limited"
        );
        return too_many_requests(&decision);
    }

    let mut response = next.run(req).await;

    let status = response.status();
    if guard.policy.skip_failed && (status.is_client_error() || status.is_server_error()) {
        guard.limiter.refund(&key);
    }

    apply_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request as HttpRequest, middleware, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(policy: RateLimitPolicy) -> Router {
        let guard = RateLimitGuard::new(Arc::new(RateLimiter::new()), policy, ProxyTrust::Proxy);
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/fail", get(|| async { StatusCode::BAD_REQUEST }))
            .layer(middleware::from_fn_with_state(guard, rate_limit))
    }

    fn request(path: &str, ip: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(path)
            .header("x-real-ip", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn sets_headers_and_denies_with_retry_after() {
        let app = app(RateLimitPolicy::new(60, 2));

        let first = app.clone().oneshot(request("/ok", "1.1.1.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-limit"], "60");
        assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

        app.clone().oneshot(request("/ok", "1.1.1.1")).await.unwrap();

        let denied = app.clone().oneshot(request("/ok", "1.1.1.1")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()["retry-after"], "1");
        assert_eq!(denied.headers()["x-ratelimit-remaining"], "0");

        let body = denied.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 429);
        assert_eq!(json["retry_after"], 1);
        assert!(json["message"].is_string());

        // Another client has its own bucket.
        let other = app.oneshot(request("/ok", "2.2.2.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn custom_key_shares_a_bucket_across_addresses() {
        let key_fn: KeyFn = Arc::new(|req: &Request, ip: &str| {
            req.headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map_or_else(|| format!("anon:{ip}"), |credential| format!("cred:{credential}"))
        });
        let guard = RateLimitGuard::new(
            Arc::new(RateLimiter::new()),
            RateLimitPolicy::new(60, 1),
            ProxyTrust::Proxy,
        )
        .with_key_fn(key_fn);
        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(guard, rate_limit));

        let with_credential = |ip: &str, credential: &str| {
            HttpRequest::builder()
                .uri("/ok")
                .header("x-real-ip", ip)
                .header("authorization", credential)
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(with_credential("4.4.4.4", "alpha")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let moved = app.clone().oneshot(with_credential("5.5.5.5", "alpha")).await.unwrap();
        assert_eq!(moved.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = app.clone().oneshot(with_credential("4.4.4.4", "beta")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);

        // Without a credential the key falls back to the resolved client IP.
        let anon = app.clone().oneshot(request("/ok", "4.4.4.4")).await.unwrap();
        assert_eq!(anon.status(), StatusCode::OK);
        let anon = app.oneshot(request("/ok", "4.4.4.4")).await.unwrap();
        assert_eq!(anon.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn failed_responses_are_refunded_when_configured() {
        let app = app(RateLimitPolicy::new(0, 1).skipping_failed());

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/fail", "3.3.3.3")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let ok = app.clone().oneshot(request("/ok", "3.3.3.3")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let again = app.oneshot(request("/ok", "3.3.3.3")).await.unwrap();
        assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn failed_responses_count_without_skip_failed() {
        let app = app(RateLimitPolicy::new(0, 1));

        let first = app.clone().oneshot(request("/fail", "4.4.4.4")).await.unwrap();
        assert_eq!(first.status(), StatusCode::BAD_REQUEST);
        let second = app.oneshot(request("/fail", "4.4.4.4")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
