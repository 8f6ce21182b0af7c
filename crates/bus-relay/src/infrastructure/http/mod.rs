//! HTTP bridge and management API (axum).
//!
//! | Method | Path             | Purpose                                   |
//! |--------|------------------|-------------------------------------------|
//! | GET    | `/bc`            | Broadcast `comm` to `player` (all/discord)|
//! | GET    | `/api/status`    | Running flag, bind host, port, clients    |
//! | GET    | `/api/clients`   | Identified clients                        |
//! | GET    | `/api/stats`     | Connection and traffic counters           |
//! | POST   | `/api/broadcast` | Arbitrary envelope to every connection    |
//! | POST   | `/api/message`   | Arbitrary envelope to one connection      |
//!
//! Every error body is `{ "error": <message>, "code": <status> }`.

pub mod handlers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::application::notifier::DispatchError;
use crate::application::registry::DeliveryError;
use crate::application::router::{BroadcastRouter, RouterError};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct ApiState {
    pub router: Arc<BroadcastRouter>,
    pub running: Arc<AtomicBool>,
    /// Bind host reported by `/api/status`.
    pub host: String,
    /// Bus port reported by `/api/status`.
    pub port: u16,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(router: Arc<BroadcastRouter>, running: Arc<AtomicBool>, host: String, port: u16) -> Self {
        Self {
            router,
            running,
            host,
            port,
            started_at: Instant::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Builds the complete HTTP application.
pub fn api_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/bc", get(handlers::broadcast_command))
        .route("/api/status", get(handlers::status))
        .route("/api/clients", get(handlers::clients))
        .route("/api/stats", get(handlers::stats))
        .route("/api/broadcast", post(handlers::broadcast_envelope))
        .route("/api/message", post(handlers::send_message))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Error response rendered as `{ error, code }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
            "code": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Validation(e) => ApiError::bad_request(e.to_string()),
            RouterError::Protocol(e) => ApiError::bad_request(format!("command cannot be framed: {e}")),
            RouterError::Dispatch(DispatchError::FeatureDisabled) => {
                ApiError::internal("discord webhook is not configured")
            }
            RouterError::Dispatch(e) => ApiError::internal(e.to_string()),
            RouterError::Delivery(e @ DeliveryError::NotFound(_)) => ApiError::not_found(e.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use bus_core::decode_message;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::application::notifier::MockNotifier;
    use crate::application::registry::{ConnectionRegistry, DisconnectReason, Registration};

    fn state_with(notifier: MockNotifier) -> ApiState {
        let registry = Arc::new(ConnectionRegistry::new(64 * 1024));
        let router = Arc::new(BroadcastRouter::new(
            registry,
            Arc::new(notifier),
            bus_core::DEFAULT_MAX_FRAME_LEN,
        ));
        ApiState::new(router, Arc::new(AtomicBool::new(true)), "127.0.0.1".into(), 8082)
    }

    fn state() -> ApiState {
        state_with(MockNotifier::new())
    }

    fn connect(state: &ApiState) -> Registration {
        state
            .router
            .registry()
            .register(SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    async fn get_json(state: &ApiState, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(state, req).await
    }

    async fn post_json(state: &ApiState, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(state, req).await
    }

    async fn send(state: &ApiState, req: Request<Body>) -> (StatusCode, Value) {
        let resp = api_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    // ── /bc ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_bc_broadcasts_to_connected_clients() {
        // Arrange
        let state = state();
        let mut a = connect(&state);
        let mut b = connect(&state);

        // Act
        let (status, body) = get_json(&state, "/bc?player=all&comm=where").await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message_id"], "busComm");
        assert_eq!(body["args"]["player"], "all");
        assert_eq!(body["args"]["comm"], "where");
        assert_eq!(body["client_count"], 2);
        assert_eq!(body["delivered"], 2);
        assert_eq!(body["attempted"], 2);
        for conn in [&mut a, &mut b] {
            let frame = conn.outbound.try_recv().expect("frame queued");
            let (msg, _) = decode_message(&frame).unwrap();
            assert_eq!(msg.arg("comm"), Some("where"));
        }
    }

    #[tokio::test]
    async fn test_bc_normalises_parameters() {
        let state = state();

        let (status, body) = get_json(&state, "/bc?player=%20ALL%20&comm=%20sit%20").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["args"]["player"], "all");
        assert_eq!(body["args"]["comm"], "sit");
        assert_eq!(body["client_count"], 0);
    }

    #[tokio::test]
    async fn test_bc_missing_comm_is_400_and_sends_nothing() {
        // Arrange
        let state = state();
        let mut conn = connect(&state);

        // Act
        let (status, body) = get_json(&state, "/bc?player=all").await;

        // Assert
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert!(body["error"].as_str().unwrap().contains("comm"));
        assert!(conn.outbound.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_bc_empty_player_is_400() {
        let state = state();
        let (status, _) = get_json(&state, "/bc?player=&comm=where").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bc_unknown_target_is_400() {
        let state = state();
        let (status, body) = get_json(&state, "/bc?player=mars&comm=where").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_bc_discord_without_webhook_is_500() {
        // Arrange
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .returning(|_| Err(DispatchError::FeatureDisabled));
        let state = state_with(notifier);

        // Act
        let (status, body) = get_json(&state, "/bc?player=discord&comm=hello").await;

        // Assert
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], 500);
        assert_eq!(body["error"], "discord webhook is not configured");
    }

    #[tokio::test]
    async fn test_bc_discord_success_reports_webhook_delivery() {
        let mut notifier = MockNotifier::new();
        notifier.expect_send().times(1).returning(|_| Ok(()));
        let state = state_with(notifier);
        let mut conn = connect(&state);

        let (status, body) = get_json(&state, "/bc?player=discord&comm=hello").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivery"], "webhook");
        assert_eq!(body["client_count"], 1);
        assert!(conn.outbound.try_recv().is_none());
    }

    // ── /api/* ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_status_reports_snapshot() {
        let state = state();
        let _a = connect(&state);

        let (status, body) = get_json(&state, "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);
        assert_eq!(body["host"], "127.0.0.1");
        assert_eq!(body["port"], 8082);
        assert_eq!(body["client_count"], 1);
    }

    #[tokio::test]
    async fn test_status_count_excludes_disconnected_clients() {
        // Arrange
        let state = state();
        let gone = connect(&state);
        let _kept = connect(&state);
        state.router.disconnect(gone.id, DisconnectReason::PeerClosed);

        // Act
        let (_, status_body) = get_json(&state, "/api/status").await;
        let (_, bc_body) = get_json(&state, "/bc?player=all&comm=count").await;

        // Assert
        assert_eq!(status_body["client_count"], 1);
        assert_eq!(bc_body["client_count"], 1);
    }

    #[tokio::test]
    async fn test_status_reflects_shutdown_flag() {
        let state = state();
        state.running.store(false, Ordering::Relaxed);

        let (_, body) = get_json(&state, "/api/status").await;

        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_clients_lists_identified_only() {
        // Arrange
        let state = state();
        let named = connect(&state);
        let _anon = connect(&state);
        state
            .router
            .registry()
            .identify(named.id, "OpenKore", false)
            .unwrap();

        // Act
        let (status, body) = get_json(&state, "/api/clients").await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        let client = &body["clients"][0];
        assert_eq!(client["id"], named.id);
        assert_eq!(client["name"], format!("OpenKore:{}", named.id));
        assert_eq!(client["user_agent"], "OpenKore");
        assert_eq!(client["address"], "127.0.0.1:50000");
        assert_eq!(client["private_only"], false);
        assert_eq!(client["connected_secs"], 0);
    }

    #[tokio::test]
    async fn test_stats_counts_connections() {
        let state = state();
        let named = connect(&state);
        let _anon = connect(&state);
        state.router.registry().identify(named.id, "A", false).unwrap();

        let (status, body) = get_json(&state, "/api/stats").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_connections"], 2);
        assert_eq!(body["identified_clients"], 1);
        assert_eq!(body["messages_processed"], 0);
        assert!(body["server_uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn test_api_broadcast_uses_default_message_id() {
        // Arrange
        let state = state();
        let mut conn = connect(&state);

        // Act
        let (status, body) =
            post_json(&state, "/api/broadcast", json!({ "args": { "map": "prontera", "x": 5 } }))
                .await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(body["message_id"], "API_BROADCAST");
        assert_eq!(body["delivered"], 1);
        let frame = conn.outbound.try_recv().unwrap();
        let (msg, _) = decode_message(&frame).unwrap();
        assert_eq!(msg.name, "API_BROADCAST");
        assert_eq!(msg.arg("map"), Some("prontera"));
        assert_eq!(msg.arg("x"), Some("5"));
    }

    #[tokio::test]
    async fn test_api_broadcast_rejects_invalid_json() {
        let state = state();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/broadcast")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, body) = send(&state, req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_api_message_targets_one_client() {
        // Arrange
        let state = state();
        let mut target = connect(&state);
        let mut other = connect(&state);

        // Act
        let (status, body) = post_json(
            &state,
            "/api/message",
            json!({ "client_id": target.id.to_string(), "message_id": "PING" }),
        )
        .await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(body["client_id"], target.id);
        let (msg, _) = decode_message(&target.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(msg.name, "PING");
        assert!(other.outbound.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_api_message_requires_client_id() {
        let state = state();
        let (status, body) = post_json(&state, "/api/message", json!({ "message_id": "X" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "client_id required");
    }

    #[tokio::test]
    async fn test_api_message_unknown_client_is_404() {
        let state = state();
        let (status, body) = post_json(&state, "/api/message", json!({ "client_id": 999 })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_404() {
        let state = state();
        let (status, body) = get_json(&state, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Not Found", "code": 404 }));
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let state = state();
        let req = Request::builder()
            .uri("/api/status")
            .header(header::ORIGIN, "http://example.test")
            .body(Body::empty())
            .unwrap();

        let resp = api_router(state).oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }
}
