//! HTTPS mailbox endpoints.
//!
//! Agents without a persistent socket register here, post envelopes for
//! routing, and poll for the envelopes queued at their address.

use crate::error::{ApiError, ApiResult};
use crate::rate_limiter::{create_rate_limiter, gcra_rate_limit};
use acn_kernel::PeerNode;
use acn_types::{AgentRecord, Envelope};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "Session-Id";

#[derive(Clone)]
pub struct MailboxState {
    peer: Arc<PeerNode>,
}

impl MailboxState {
    pub fn new(peer: Arc<PeerNode>) -> Self {
        Self { peer }
    }

    /// Address owning the session named by the request headers.
    fn session(&self, headers: &HeaderMap) -> ApiResult<(String, String)> {
        let token = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthorized)?;
        let address = self
            .peer
            .mailbox_address(token)
            .ok_or(ApiError::Unauthorized)?;
        Ok((token.to_string(), address))
    }
}

/// Mailbox routes with per-IP rate limiting.
pub fn router(peer: Arc<PeerNode>, rate_limit_per_minute: u32) -> Router {
    let limiter = create_rate_limiter(rate_limit_per_minute);
    Router::new()
        .route("/register", post(register))
        .route("/unregister", get(unregister))
        .route("/ssl_signature", get(ssl_signature))
        .route("/send_envelope", post(send_envelope))
        .route("/get_envelope", get(get_envelope))
        .layer(middleware::from_fn_with_state(limiter, gcra_rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(MailboxState::new(peer))
}

async fn register(State(state): State<MailboxState>, body: Bytes) -> ApiResult<String> {
    let record: AgentRecord = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid agent record: {e}")))?;
    let address = record.address.clone();
    let token = state.peer.register_mailbox(record).await.map_err(|e| {
        warn!(addr = %address, error = %e, "Mailbox: registration rejected");
        ApiError::BadRequest(e.to_status().to_string())
    })?;
    info!(addr = %address, op = "register", "Mailbox: session opened");
    Ok(token)
}

async fn unregister(State(state): State<MailboxState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let (token, _) = state.session(&headers)?;
    state.peer.unregister_mailbox(&token);
    Ok(StatusCode::OK)
}

async fn ssl_signature(State(state): State<MailboxState>) -> ApiResult<String> {
    state
        .peer
        .tls_signature_hex()
        .ok_or_else(|| ApiError::Unavailable("no TLS session identity".into()))
}

async fn send_envelope(
    State(state): State<MailboxState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let (_, address) = state.session(&headers)?;
    let envelope = Envelope::from_bytes(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid envelope: {e}")))?;
    if envelope.sender != address {
        return Err(ApiError::BadRequest(format!(
            "envelope sender {} does not match session address {}",
            envelope.sender, address
        )));
    }
    debug!(to = %envelope.to, sender = %address, op = "route", "Mailbox: routing envelope");
    state.peer.route_envelope(envelope).await.map_err(|e| {
        warn!(sender = %address, error = %e, "Mailbox: routing failed");
        ApiError::Routing(e.to_status().to_string())
    })?;
    Ok(StatusCode::OK)
}

async fn get_envelope(State(state): State<MailboxState>, headers: HeaderMap) -> ApiResult<Response> {
    let (token, _) = state.session(&headers)?;
    let Some(envelope) = state.peer.pop_mailbox(&token) else {
        return Ok(StatusCode::OK.into_response());
    };
    let body = envelope
        .to_bytes()
        .map_err(|e| ApiError::Unavailable(format!("cannot encode envelope: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use acn_types::config::AcnConfig;
    use acn_types::{LedgerId, LedgerKey, NodeKey};
    use acn_wire::MemoryNetwork;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn peer(dir: &std::path::Path) -> (Arc<PeerNode>, NodeKey) {
        let key = NodeKey::generate();
        let agent = LedgerKey::generate(LedgerId::Fetchai);
        let mut config = AcnConfig::default();
        config.node.key = Some(key.to_hex());
        config.agent = Some(AgentRecord::sign(&agent, &key.public_key()).unwrap());
        config.peer.storage_path = Some(dir.join("records"));
        config.mailbox.listen_addr = Some("127.0.0.1:0".into());
        let net = MemoryNetwork::new();
        let node = PeerNode::start(config, net.add_peer(&key)).await.unwrap();
        (node, key)
    }

    fn mailbox_record(key: &NodeKey) -> AgentRecord {
        AgentRecord::sign(&LedgerKey::generate(LedgerId::Cosmos), &key.public_key()).unwrap()
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn with_session(method: &str, uri: &str, token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(SESSION_HEADER, token)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_poll() {
        let dir = tempfile::tempdir().unwrap();
        let (node, key) = peer(dir.path()).await;
        let app = router(Arc::clone(&node), 10_000);
        let record = mailbox_record(&key);

        let (status, body) = call(
            &app,
            Request::post("/register")
                .body(Body::from(serde_json::to_vec(&record).unwrap()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = String::from_utf8(body).unwrap();
        assert_eq!(token.len(), 32);

        let (status, body) = call(&app, with_session("GET", "/get_envelope", &token, vec![])).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let own = node.agent_address().unwrap().to_string();
        node.route_envelope(Envelope::new(&record.address, &own, b"queued".to_vec()))
            .await
            .unwrap();
        let (status, body) = call(&app, with_session("GET", "/get_envelope", &token, vec![])).await;
        assert_eq!(status, StatusCode::OK);
        let env = Envelope::from_bytes(&body).unwrap();
        assert_eq!(env.message, b"queued");
        assert_eq!(env.sender, own);

        let (status, _) = call(&app, with_session("GET", "/unregister", &token, vec![])).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, with_session("GET", "/get_envelope", &token, vec![])).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        node.close().await;
    }

    #[tokio::test]
    async fn test_register_rejects_foreign_record() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = peer(dir.path()).await;
        let app = router(Arc::clone(&node), 10_000);
        let foreign = mailbox_record(&NodeKey::generate());

        let (status, body) = call(
            &app,
            Request::post("/register")
                .body(Body::from(serde_json::to_vec(&foreign).unwrap()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.is_empty());

        let (status, _) = call(
            &app,
            Request::post("/register").body(Body::from("not json")).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        node.close().await;
    }

    #[tokio::test]
    async fn test_send_envelope_routes_and_checks_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (node, key) = peer(dir.path()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.set_envelope_handler(Arc::new(tx));
        node.set_ready(true);
        let app = router(Arc::clone(&node), 10_000);

        let record = mailbox_record(&key);
        let token = node.register_mailbox(record.clone()).await.unwrap();
        let own = node.agent_address().unwrap().to_string();

        let env = Envelope::new(&own, &record.address, b"hello".to_vec());
        let (status, _) = call(
            &app,
            with_session("POST", "/send_envelope", &token, env.to_bytes().unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().message, b"hello");

        let spoofed = Envelope::new(&own, "fetch1someoneelse", vec![]);
        let (status, _) = call(
            &app,
            with_session("POST", "/send_envelope", &token, spoofed.to_bytes().unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            with_session("POST", "/send_envelope", "0000", env.to_bytes().unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        node.close().await;
    }

    #[tokio::test]
    async fn test_send_envelope_unroutable_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let key = NodeKey::generate();
        let mut config = AcnConfig::default();
        config.node.key = Some(key.to_hex());
        config.peer.storage_path = Some(dir.path().join("records"));
        config.peer.lookup_timeout_ms = 200;
        config.peer.lookup_retry_ms = 20;
        let net = MemoryNetwork::new();
        let node = PeerNode::start(config, net.add_peer(&key)).await.unwrap();
        let app = router(Arc::clone(&node), 10_000);

        let record = mailbox_record(&key);
        let token = node.register_mailbox(record.clone()).await.unwrap();
        let env = Envelope::new("fetch1nowhere", &record.address, vec![]);
        let (status, body) = call(
            &app,
            with_session("POST", "/send_envelope", &token, env.to_bytes().unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(String::from_utf8(body).unwrap().contains("ERROR_UNKNOWN_AGENT_ADDRESS"));
        node.close().await;
    }

    #[tokio::test]
    async fn test_ssl_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = peer(dir.path()).await;
        let app = router(Arc::clone(&node), 10_000);
        let (status, body) = call(&app, Request::get("/ssl_signature").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).unwrap(), node.tls_signature_hex().unwrap());
        node.close().await;
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = peer(dir.path()).await;
        let app = router(Arc::clone(&node), 2);
        let get = || Request::get("/ssl_signature").body(Body::empty()).unwrap();
        assert_eq!(call(&app, get()).await.0, StatusCode::OK);
        assert_eq!(call(&app, get()).await.0, StatusCode::OK);
        assert_eq!(call(&app, get()).await.0, StatusCode::TOO_MANY_REQUESTS);
        node.close().await;
    }
}
