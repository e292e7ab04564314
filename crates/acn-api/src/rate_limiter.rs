//! Cost-aware rate limiting using GCRA (Generic Cell Rate Algorithm).
//!
//! Each mailbox endpoint has a token cost (register=10, send_envelope=2,
//! polling=1). The budget is `rate_limit_per_minute` tokens per client IP.

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::middleware::Next;
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

const fn cost(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(c) => c,
        None => NonZeroU32::MIN,
    }
}

pub fn operation_cost(method: &str, path: &str) -> NonZeroU32 {
    match (method, path) {
        ("POST", "/register") => cost(10),
        ("POST", "/send_envelope") => cost(2),
        ("GET", "/get_envelope") => cost(1),
        ("GET", "/unregister") => cost(1),
        ("GET", "/ssl_signature") => cost(1),
        _ => cost(5),
    }
}

pub type KeyedRateLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// `per_minute` tokens per minute per IP.
pub fn create_rate_limiter(per_minute: u32) -> Arc<KeyedRateLimiter> {
    let quota = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::keyed(Quota::per_minute(quota)))
}

/// GCRA rate limiting middleware.
///
/// Extracts the client IP from `ConnectInfo`, computes the cost for the
/// requested endpoint, and checks the GCRA limiter. Returns 429 if the
/// client has exhausted its token budget.
pub async fn gcra_rate_limit(
    axum::extract::State(limiter): axum::extract::State<Arc<KeyedRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let cost = operation_cost(&method, &path);

    // Outer error: cost above burst size; inner error: budget exhausted.
    if !matches!(limiter.check_key_n(&ip, cost), Ok(Ok(()))) {
        tracing::warn!(ip = %ip, cost = cost.get(), path = %path, "Mailbox rate limit exceeded");
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("retry-after", "60")
            .body(Body::from("rate limit exceeded"))
            .unwrap_or_default();
    }

    next.run(request).await
}
