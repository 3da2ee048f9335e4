//! End-to-end control-plane tests over real sockets: admission, session
//! lifecycle and replacement, approval round-trip and expiry.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use moltagent_common::Manifest;
use moltagent_common::types::{
    AgentConnection, ApprovalState, InstanceStatus, VpsInstance,
};
use moltagent_control_plane::api::{self, ApiState};
use moltagent_control_plane::approvals::ApprovalManager;
use moltagent_control_plane::fleet::FleetManager;
use moltagent_control_plane::providers::{
    CreateRequest, ProviderError, ProviderRegistry, VpsProvider,
};
use moltagent_control_plane::provisioner::Provisioner;
use moltagent_control_plane::server::ControlPlaneServer;

const TOKEN: &str = "T";
const U1: &str = "11111111-1111-4111-8111-111111111111";

struct StubProvider;

#[async_trait]
impl VpsProvider for StubProvider {
    fn name(&self) -> &'static str {
        "docker-local"
    }

    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError> {
        Ok(VpsInstance {
            id: "stub-1".to_string(),
            provider: "docker-local".to_string(),
            status: InstanceStatus::Creating,
            ipv4: Some("127.0.0.1".to_string()),
            ipv6: None,
            server_type: "container".to_string(),
            region: "local".to_string(),
            created_at: Utc::now(),
            agent_id: req.manifest.identity.id.to_string(),
            metadata: serde_json::Map::new(),
        })
    }

    async fn destroy(&self, _instance_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn status(&self, _instance_id: &str) -> Result<Option<VpsInstance>, ProviderError> {
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError> {
        Ok(Vec::new())
    }
}

struct TestPlane {
    addr: SocketAddr,
    state: ApiState,
    _dir: tempfile::TempDir,
}

async fn start_plane() -> TestPlane {
    let dir = tempfile::tempdir().expect("tempdir");
    let fleet = Arc::new(FleetManager::load(dir.path().join("fleet.json")));
    let approvals = Arc::new(ApprovalManager::new());
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(StubProvider));
    let provisioner = Arc::new(Provisioner::new(
        Arc::new(registry),
        "docker-local".to_string(),
    ));
    let server = Arc::new(ControlPlaneServer::new(
        TOKEN.to_string(),
        Arc::clone(&fleet),
        Arc::clone(&approvals),
    ));

    // Same wiring the orchestrator does: expiry relays a denial.
    let relay = Arc::clone(&server);
    approvals.set_on_resolved(Box::new(move |entry| {
        if entry.state == ApprovalState::Expired {
            relay.send_approval_response(&entry.agent_id, &entry.id, false, None);
        }
    }));

    let state = ApiState {
        server,
        fleet,
        approvals,
        provisioner,
        token: TOKEN.to_string(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(
        listener,
        state.clone(),
        std::future::pending::<()>(),
    ));

    TestPlane {
        addr,
        state,
        _dir: dir,
    }
}

type WorkerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_worker(addr: SocketAddr, agent_id: &str) -> WorkerSocket {
    let mut request = format!("ws://{addr}/?agentId={agent_id}")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap(),
    );
    let (socket, _) = connect_async(request).await.expect("worker connect");
    socket
}

fn register(state: &ApiState, agent_id: &str) {
    let manifest = Manifest::from_value(json!({
        "identity": {"id": agent_id, "name": "a1"},
        "controlPlane": {"token": TOKEN},
    }))
    .unwrap();
    state.fleet.register_agent(manifest, None);
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn admission_rejects_bad_token_and_missing_agent_id() {
    let plane = start_plane().await;

    let no_token = format!("ws://{}/?agentId=U1", plane.addr);
    match connect_async(no_token).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401 rejection, got {other:?}"),
    }

    let no_agent = format!("ws://{}/?token={TOKEN}", plane.addr);
    match connect_async(no_agent).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        other => panic!("expected 400 rejection, got {other:?}"),
    }

    // Query-parameter token is accepted as an alternative to the header.
    let query_token = format!("ws://{}/?agentId=U1&token={TOKEN}", plane.addr);
    assert!(connect_async(query_token).await.is_ok());
}

#[tokio::test]
async fn session_lifecycle_marks_fleet_and_preserves_counters() {
    let plane = start_plane().await;
    register(&plane.state, U1);

    // Connect: online.
    let mut socket = connect_worker(plane.addr, U1).await;
    let fleet = Arc::clone(&plane.state.fleet);
    wait_until(
        || fleet.get(U1).unwrap().connection == AgentConnection::Online,
        "agent online",
    )
    .await;

    // Record one action over the wire.
    let action = json!({
        "type": "action",
        "agentId": U1,
        "entry": {
            "id": "a-1",
            "timestamp": Utc::now(),
            "category": "spend",
            "summary": "bought credits",
            "details": {"amount": 3.0},
        },
    });
    socket.send(Message::Text(action.to_string().into())).await.unwrap();
    wait_until(|| fleet.get(U1).unwrap().total_actions == 1, "action recorded").await;
    assert_eq!(fleet.get(U1).unwrap().total_spend, 3.0);

    // Kill the socket: offline.
    socket.close(None).await.unwrap();
    wait_until(
        || fleet.get(U1).unwrap().connection == AgentConnection::Offline,
        "agent offline",
    )
    .await;

    // Reconnect: online again, counters preserved.
    let _socket = connect_worker(plane.addr, U1).await;
    wait_until(
        || fleet.get(U1).unwrap().connection == AgentConnection::Online,
        "agent online again",
    )
    .await;
    assert_eq!(fleet.get(U1).unwrap().total_actions, 1);
}

#[tokio::test]
async fn second_connection_replaces_first_with_close_4000() {
    let plane = start_plane().await;
    register(&plane.state, U1);

    let mut first = connect_worker(plane.addr, U1).await;
    let server = Arc::clone(&plane.state.server);
    wait_until(|| server.is_online(U1), "first session").await;

    let _second = connect_worker(plane.addr, U1).await;

    // The first socket is told it was displaced.
    let mut close_code = None;
    while let Some(Ok(message)) = first.next().await {
        if let Message::Close(Some(frame)) = message {
            close_code = Some((u16::from(frame.code), frame.reason.to_string()));
            break;
        }
    }
    let (code, reason) = close_code.expect("close frame for displaced session");
    assert_eq!(code, 4000);
    assert_eq!(reason, "Replaced by new connection");

    // Exactly one live session remains and the agent is still online.
    assert!(server.is_online(U1));
    assert_eq!(server.connected_agents().len(), 1);
    assert_eq!(
        plane.state.fleet.get(U1).unwrap().connection,
        AgentConnection::Online
    );
}

#[tokio::test]
async fn approval_round_trip_reaches_worker() {
    let plane = start_plane().await;
    register(&plane.state, U1);
    let mut socket = connect_worker(plane.addr, U1).await;

    let request = json!({
        "type": "approval_request",
        "agentId": U1,
        "request": {
            "id": "R1",
            "category": "spend",
            "description": "api credits",
            "amount": 12.5,
            "expiresAt": Utc::now() + chrono::Duration::seconds(60),
        },
    });
    socket.send(Message::Text(request.to_string().into())).await.unwrap();
    let approvals = Arc::clone(&plane.state.approvals);
    wait_until(|| !approvals.pending(None).is_empty(), "request queued").await;

    // Operator approves over the HTTP surface.
    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/moltagent/dashboard/approvals/R1/respond",
            plane.addr
        ))
        .bearer_auth(TOKEN)
        .json(&json!({"approved": true, "respondedBy": "op"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // The worker sees the decision.
    let frame = tokio::time::timeout(Duration::from_millis(500), socket.next())
        .await
        .expect("approval response within deadline")
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(value["type"], "approval_response");
    assert_eq!(value["requestId"], "R1");
    assert_eq!(value["approved"], true);

    // History records the approval; the queue is empty again.
    let history = plane.state.approvals.history(10, 0);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, ApprovalState::Approved);
    assert_eq!(history[0].responded_by.as_deref(), Some("op"));
    assert!(plane.state.approvals.pending(None).is_empty());

    // Responding again is a 404: the transition is terminal.
    let repeat = reqwest::Client::new()
        .post(format!(
            "http://{}/moltagent/dashboard/approvals/R1/respond",
            plane.addr
        ))
        .bearer_auth(TOKEN)
        .json(&json!({"approved": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(repeat.status().as_u16(), 404);
}

#[tokio::test]
async fn approval_expiry_relays_denial_to_worker() {
    let plane = start_plane().await;
    register(&plane.state, U1);
    let mut socket = connect_worker(plane.addr, U1).await;

    let request = json!({
        "type": "approval_request",
        "agentId": U1,
        "request": {
            "id": "R2",
            "category": "spend",
            "description": "api credits",
            "expiresAt": Utc::now() + chrono::Duration::milliseconds(50),
        },
    });
    socket.send(Message::Text(request.to_string().into())).await.unwrap();
    let approvals = Arc::clone(&plane.state.approvals);
    wait_until(|| !approvals.pending(None).is_empty(), "request queued").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let expired = plane.state.approvals.sweep_once(Utc::now());
    assert_eq!(expired.len(), 1);

    let frame = tokio::time::timeout(Duration::from_millis(500), socket.next())
        .await
        .expect("denial within deadline")
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(value["type"], "approval_response");
    assert_eq!(value["requestId"], "R2");
    assert_eq!(value["approved"], false);

    let history = plane.state.approvals.history(10, 0);
    assert_eq!(history[0].state, ApprovalState::Expired);
}

#[tokio::test]
async fn deploy_registers_agent_with_unknown_connection() {
    let plane = start_plane().await;

    let manifest = json!({
        "identity": {"id": U1, "name": "a1"},
        "controlPlane": {"url": "ws://localhost:18790", "token": TOKEN},
        "resources": {"provider": "docker-local"},
        "financialControls": {"maxPerDay": 10},
    });
    let response = reqwest::Client::new()
        .post(format!("http://{}/moltagent/dashboard/agents", plane.addr))
        .bearer_auth(TOKEN)
        .json(&manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["agentId"], U1);
    assert_eq!(body["instance"]["id"], "stub-1");

    let record = plane.state.fleet.get(U1).expect("registered");
    assert_eq!(record.connection, AgentConnection::Unknown);
    assert!(record.instance.is_some());

    // Invalid manifests are rejected with the issue list.
    let invalid = json!({"goals": [{"description": "g", "priority": 9}]});
    let response = reqwest::Client::new()
        .post(format!("http://{}/moltagent/dashboard/agents", plane.addr))
        .bearer_auth(TOKEN)
        .json(&invalid)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Without the bearer token the dashboard is closed.
    let response = reqwest::Client::new()
        .get(format!("http://{}/moltagent/dashboard/overview", plane.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn commands_to_offline_agents_return_503() {
    let plane = start_plane().await;
    register(&plane.state, U1);

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/moltagent/dashboard/agents/{U1}/restart",
            plane.addr
        ))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["agentOnline"], false);
}
