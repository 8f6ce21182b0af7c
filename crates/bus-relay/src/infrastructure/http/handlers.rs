//! Request handlers for the HTTP bridge.
//!
//! Handlers validate, call into the [`BroadcastRouter`](crate::application::BroadcastRouter)
//! and shape the JSON reply.  None of them wait on a bus client: "delivered"
//! means accepted into a connection's outbound queue.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::Json;
use bus_core::Message;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{ApiError, ApiState};
use crate::application::registry::{ConnectionId, ConnectionInfo, DeliveryError};
use crate::application::router::{BroadcastOutcome, RouterError};
use crate::domain::{BroadcastRequest, COMMAND_ENVELOPE};

const DEFAULT_BROADCAST_ID: &str = "API_BROADCAST";
const DEFAULT_MESSAGE_ID: &str = "API_MESSAGE";

// ── Request / response shapes ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct BroadcastParams {
    pub player: Option<String>,
    pub comm: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnvelopeBody {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Client ids arrive either as JSON numbers or as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ClientIdParam {
    Number(ConnectionId),
    Text(String),
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub client_id: Option<ClientIdParam>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct ClientView {
    pub id: ConnectionId,
    pub name: String,
    pub user_agent: String,
    pub address: String,
    pub private_only: bool,
    pub identified: bool,
    pub idle_secs: u64,
    pub connected_secs: u64,
}

impl From<&ConnectionInfo> for ClientView {
    fn from(info: &ConnectionInfo) -> Self {
        Self {
            id: info.id,
            name: info.name(),
            user_agent: info.user_agent.clone().unwrap_or_default(),
            address: info.peer.to_string(),
            private_only: info.private_only,
            identified: info.identified,
            idle_secs: info.idle().as_secs(),
            connected_secs: info.connected_for().as_secs(),
        }
    }
}

// ── GET /bc ───────────────────────────────────────────────────────────────────

pub async fn broadcast_command(
    State(state): State<ApiState>,
    params: Result<Query<BroadcastParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let request = BroadcastRequest::new(params.player.as_deref(), params.comm.as_deref())
        .map_err(RouterError::from)?;

    let outcome = state.router.dispatch(&request).await?;
    let client_count = match &outcome {
        BroadcastOutcome::Bus(delivery) => delivery.client_count,
        BroadcastOutcome::Webhook => state.router.registry().snapshot().len(),
    };

    Ok(Json(json!({
        "status": "success",
        "message_id": COMMAND_ENVELOPE,
        "args": {
            "player": request.target.as_str(),
            "comm": request.command,
        },
        "client_count": client_count,
        "delivered": outcome.delivered(),
        "attempted": outcome.attempted(),
        "delivery": outcome.channel(),
    })))
}

// ── GET /api/* ────────────────────────────────────────────────────────────────

pub async fn status(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "running": state.is_running(),
        "host": state.host,
        "port": state.port,
        "client_count": state.router.registry().snapshot().len(),
    }))
}

pub async fn clients(State(state): State<ApiState>) -> Json<Value> {
    let clients: Vec<ClientView> = state
        .router
        .registry()
        .list()
        .iter()
        .filter(|c| c.identified)
        .map(ClientView::from)
        .collect();
    let count = clients.len();
    Json(json!({ "clients": clients, "count": count }))
}

pub async fn stats(State(state): State<ApiState>) -> Json<Value> {
    let registry = state.router.registry();
    let counters = state.router.stats();
    Json(json!({
        "total_connections": registry.len(),
        "identified_clients": registry.identified_count(),
        "server_uptime_secs": state.started_at.elapsed().as_secs(),
        "messages_processed": counters.messages_processed,
        "frames_relayed": counters.frames_relayed,
    }))
}

// ── POST /api/* ───────────────────────────────────────────────────────────────

pub async fn broadcast_envelope(
    State(state): State<ApiState>,
    body: Result<Json<EnvelopeBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(bad_json)?;
    let message_id = non_empty_or(body.message_id, DEFAULT_BROADCAST_ID);
    let msg = envelope(&message_id, &body.args);

    let delivery = state.router.broadcast(&msg)?;
    Ok(Json(json!({
        "status": "sent",
        "message_id": message_id,
        "delivered": delivery.delivered,
        "attempted": delivery.attempted,
    })))
}

pub async fn send_message(
    State(state): State<ApiState>,
    body: Result<Json<MessageBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(bad_json)?;
    let id = match body.client_id {
        None => return Err(ApiError::bad_request("client_id required")),
        Some(ClientIdParam::Text(ref s)) if s.trim().is_empty() => {
            return Err(ApiError::bad_request("client_id required"))
        }
        Some(ClientIdParam::Number(id)) => id,
        Some(ClientIdParam::Text(s)) => s
            .trim()
            .parse::<ConnectionId>()
            .map_err(|_| ApiError::not_found("Client not found"))?,
    };
    let message_id = non_empty_or(body.message_id, DEFAULT_MESSAGE_ID);
    let msg = envelope(&message_id, &body.args);

    match state.router.send_to(id, &msg) {
        Ok(()) => Ok(Json(json!({ "status": "sent", "client_id": id }))),
        Err(RouterError::Delivery(DeliveryError::NotFound(_))) => {
            Err(ApiError::not_found("Client not found"))
        }
        Err(e) => Err(e.into()),
    }
}

// ── Fallback ──────────────────────────────────────────────────────────────────

pub async fn not_found() -> ApiError {
    ApiError::not_found("Not Found")
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request(format!("Bad Request: {}", rejection.body_text()))
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Flattens a JSON object into bus arguments.  Strings pass through; other
/// values use their JSON text; `null` becomes empty.
fn envelope(name: &str, args: &Map<String, Value>) -> Message {
    let mut msg = Message::new(name);
    for (key, value) in args {
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        msg.push_arg(key.as_str(), value);
    }
    msg
}
