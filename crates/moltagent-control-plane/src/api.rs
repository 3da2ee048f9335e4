//! HTTP management surface.
//!
//! Every route under `/moltagent` requires the shared bearer token; the
//! WebSocket upgrade at `/` and the `/health` liveness probe sit outside
//! the protected tree (the upgrade does its own admission).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use moltagent_common::manifest::{Goal, InlineDocument, Manifest};
use moltagent_common::protocol::PlaneMessage;

use crate::approvals::ApprovalManager;
use crate::bootstrap;
use crate::fleet::FleetManager;
use crate::provisioner::{ProvisionError, Provisioner};
use crate::server::{ControlPlaneServer, bearer_token};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub server: Arc<ControlPlaneServer>,
    pub fleet: Arc<FleetManager>,
    pub approvals: Arc<ApprovalManager>,
    pub provisioner: Arc<Provisioner>,
    pub token: String,
}

/// Build the full router: WS upgrade, liveness, and the protected
/// dashboard tree.
pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/dashboard/overview", get(overview))
        .route("/dashboard/agents", get(list_agents).post(create_agent))
        .route("/dashboard/agents/{id}", get(get_agent).delete(delete_agent))
        .route("/dashboard/agents/{id}/actions", get(agent_actions))
        .route("/dashboard/agents/{id}/message", post(send_message))
        .route("/dashboard/agents/{id}/goals", post(update_goals))
        .route("/dashboard/agents/{id}/knowledge", post(inject_knowledge))
        .route("/dashboard/agents/{id}/restart", post(restart_agent))
        .route("/dashboard/approvals", get(pending_approvals))
        .route("/dashboard/approvals/history", get(approval_history))
        .route("/dashboard/approvals/{id}/respond", post(respond_approval))
        .route("/ready", post(worker_ready))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    // The upgrade is reachable both at the root (standalone port) and under
    // the prefix (embedded deployments); admission is its own, so the `/ws`
    // route joins the nest after the bearer layer is applied.
    let prefixed = Router::new()
        .route("/ws", get(crate::server::ws_upgrade))
        .merge(protected);

    Router::new()
        .route("/health", get(health))
        .route("/", get(crate::server::ws_upgrade))
        .nest("/moltagent", prefixed)
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server error")
}

async fn require_bearer(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.token.is_empty() {
        let presented = bearer_token(request.headers()).unwrap_or_default();
        if presented != state.token {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})))
                .into_response();
        }
    }
    next.run(request).await
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Dashboard ─────────────────────────────────────────────────────────────────

async fn overview(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "fleet": state.fleet.summary(),
        "approvals": state.approvals.summary(),
        "onlineAgents": state.fleet.online_agents(),
    }))
}

async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    let agents: Vec<Value> = state
        .fleet
        .list()
        .into_iter()
        .map(|(id, record)| {
            json!({
                "agentId": id,
                "name": record.manifest.identity.name,
                "connection": record.connection,
                "state": record.last_status.as_ref().map(|s| s.state),
                "instanceStatus": record.instance.as_ref().map(|i| i.status),
                "lastHeartbeat": record.last_heartbeat,
                "totalActions": record.total_actions,
                "totalSpend": record.total_spend,
            })
        })
        .collect();
    Json(json!({"agents": agents}))
}

async fn get_agent(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.fleet.get(&id) {
        Some(record) => {
            let value = serde_json::to_value(&record).unwrap_or_default();
            Json(redact_secrets(value)).into_response()
        }
        None => not_found("unknown agent"),
    }
}

async fn create_agent(State(state): State<ApiState>, Json(body): Json<Value>) -> Response {
    let manifest = match Manifest::from_value(body) {
        Ok(m) => m,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "manifest validation failed", "issues": e.issues})),
            )
                .into_response();
        }
    };

    let script = bootstrap::generate(&manifest);
    let instance = match state.provisioner.provision(&manifest, &script).await {
        Ok(instance) => instance,
        Err(e @ ProvisionError::UnknownProvider { .. }) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let agent_id = manifest.identity.id.to_string();
    state.fleet.register_agent(manifest, Some(instance.clone()));
    (
        StatusCode::CREATED,
        Json(json!({"agentId": agent_id, "instance": instance})),
    )
        .into_response()
}

async fn delete_agent(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    // Best-effort teardown: tell the worker to stop, then take the VPS down,
    // then forget the record.
    let shutdown_sent = state.server.send_to_agent(&id, &PlaneMessage::Shutdown);
    let instance_destroyed = match state.provisioner.destroy(&id).await {
        Ok(()) => true,
        Err(ProvisionError::NotFound(_)) => false,
        Err(e) => {
            info!(agent_id = %id, error = %e, "instance teardown failed during delete");
            false
        }
    };
    let removed = state.fleet.remove_agent(&id);
    Json(json!({
        "removed": removed,
        "shutdownSent": shutdown_sent,
        "instanceDestroyed": instance_destroyed,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn agent_actions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    let limit = page.limit.unwrap_or(50);
    let offset = page.offset.unwrap_or(0);
    match state.fleet.actions(&id, limit, offset) {
        Some(actions) => Json(json!({"actions": actions})).into_response(),
        None => not_found("unknown agent"),
    }
}

async fn send_message(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let content = body["content"].as_str().unwrap_or_default().to_string();
    if content.is_empty() {
        return bad_request("content is required");
    }
    let channel = body["channel"].as_str().map(str::to_string);
    relay(&state, &id, &PlaneMessage::SendMessage { content, channel })
}

async fn update_goals(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let goals: Vec<Goal> = match serde_json::from_value(body["goals"].clone()) {
        Ok(goals) => goals,
        Err(e) => return bad_request(&format!("invalid goals: {e}")),
    };
    relay(&state, &id, &PlaneMessage::UpdateGoals { goals })
}

async fn inject_knowledge(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let documents: Vec<InlineDocument> = match serde_json::from_value(body["documents"].clone()) {
        Ok(documents) => documents,
        Err(e) => return bad_request(&format!("invalid documents: {e}")),
    };
    relay(&state, &id, &PlaneMessage::InjectKnowledge { documents })
}

async fn restart_agent(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    relay(&state, &id, &PlaneMessage::Restart)
}

/// Relay a command to a worker, answering 503 when it is offline.
fn relay(state: &ApiState, agent_id: &str, message: &PlaneMessage) -> Response {
    if state.server.send_to_agent(agent_id, message) {
        Json(json!({"delivered": true})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "agent is not connected", "agentOnline": false})),
        )
            .into_response()
    }
}

// ── Approvals ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApprovalQuery {
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
}

async fn pending_approvals(
    State(state): State<ApiState>,
    Query(query): Query<ApprovalQuery>,
) -> impl IntoResponse {
    Json(json!({
        "approvals": state.approvals.pending(query.agent_id.as_deref()),
    }))
}

async fn approval_history(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> impl IntoResponse {
    Json(json!({
        "history": state
            .approvals
            .history(page.limit.unwrap_or(50), page.offset.unwrap_or(0)),
    }))
}

async fn respond_approval(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some(approved) = body["approved"].as_bool() else {
        return bad_request("approved is required");
    };
    let responded_by = body["respondedBy"].as_str().unwrap_or("operator");
    let reason = body["reason"].as_str().map(str::to_string);

    match state
        .approvals
        .resolve(&id, approved, responded_by, reason.clone())
    {
        Some(entry) => {
            let delivered =
                state
                    .server
                    .send_approval_response(&entry.agent_id, &entry.id, approved, reason);
            Json(json!({"approval": entry, "delivered": delivered})).into_response()
        }
        None => not_found("unknown or already-resolved approval"),
    }
}

// ── Worker readiness ──────────────────────────────────────────────────────────

/// Best-effort ping from a node's bootstrap script once the worker unit is up.
async fn worker_ready(Json(body): Json<Value>) -> impl IntoResponse {
    let agent_id = body["agentId"].as_str().unwrap_or("unknown");
    info!(agent_id = %agent_id, "worker node reported ready");
    Json(json!({"ok": true}))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
}

/// Blank out the control-plane token and channel credentials before a
/// record leaves the API.
fn redact_secrets(mut value: Value) -> Value {
    if let Some(token) = value.pointer_mut("/manifest/controlPlane/token") {
        if token.as_str().is_some_and(|t| !t.is_empty()) {
            *token = json!("***");
        }
    }
    if let Some(channels) = value
        .pointer_mut("/manifest/channels")
        .and_then(Value::as_array_mut)
    {
        for channel in channels {
            if let Some(credentials) = channel
                .get_mut("credentials")
                .and_then(Value::as_object_mut)
            {
                for secret in credentials.values_mut() {
                    *secret = json!("***");
                }
            }
        }
    }
    value
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_token_and_channel_credentials() {
        let record = json!({
            "manifest": {
                "controlPlane": {"url": "ws://x", "token": "secret"},
                "channels": [
                    {"type": "telegram", "credentials": {"botToken": "123:abc"}},
                    {"type": "email", "credentials": {"password": "hunter2", "user": "a"}},
                ],
            },
            "totalSpend": 3.0,
        });
        let redacted = redact_secrets(record);
        assert_eq!(redacted["manifest"]["controlPlane"]["token"], "***");
        assert_eq!(redacted["manifest"]["channels"][0]["credentials"]["botToken"], "***");
        assert_eq!(redacted["manifest"]["channels"][1]["credentials"]["password"], "***");
        assert_eq!(redacted["manifest"]["channels"][1]["credentials"]["user"], "***");
        assert_eq!(redacted["totalSpend"], 3.0);
    }

    #[test]
    fn redaction_leaves_empty_token_alone() {
        let record = json!({"manifest": {"controlPlane": {"token": ""}}});
        let redacted = redact_secrets(record);
        assert_eq!(redacted["manifest"]["controlPlane"]["token"], "");
    }
}
