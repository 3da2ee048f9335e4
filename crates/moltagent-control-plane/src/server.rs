//! Multi-worker WebSocket session manager.
//!
//! The server exclusively owns the set of live sessions and enforces
//! at-most-one per agent id: a new connection for an already-connected
//! agent displaces the old session with close code 4000. Fleet records
//! are only ever mutated through the fleet manager's interface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use moltagent_common::protocol::{
    CLOSE_GOING_AWAY, CLOSE_REPLACED, CLOSE_REPLACED_REASON, PlaneMessage, WorkerMessage,
};
use moltagent_common::types::AgentConnection;

use crate::api::ApiState;
use crate::approvals::ApprovalManager;
use crate::fleet::FleetManager;

enum SessionCommand {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

/// Server-side handle for one live worker session.
struct Session {
    id: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    remote_addr: String,
}

/// A snapshot row describing one connected agent.
#[derive(Debug, Clone)]
pub struct ConnectedAgent {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub remote_addr: String,
}

/// Authenticated fan-in/fan-out hub for worker sessions.
pub struct ControlPlaneServer {
    token: String,
    fleet: Arc<FleetManager>,
    approvals: Arc<ApprovalManager>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    accepting: AtomicBool,
    session_counter: AtomicU64,
}

impl ControlPlaneServer {
    #[must_use]
    pub fn new(token: String, fleet: Arc<FleetManager>, approvals: Arc<ApprovalManager>) -> Self {
        Self {
            token,
            fleet,
            approvals,
            sessions: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            session_counter: AtomicU64::new(0),
        }
    }

    /// Whether the agent currently holds a live session.
    #[must_use]
    pub fn is_online(&self, agent_id: &str) -> bool {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .contains_key(agent_id)
    }

    /// Snapshot of every live session.
    #[must_use]
    pub fn connected_agents(&self) -> Vec<ConnectedAgent> {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .iter()
            .map(|(agent_id, s)| ConnectedAgent {
                agent_id: agent_id.clone(),
                connected_at: s.connected_at,
                last_heartbeat: *s.last_heartbeat.lock().expect("session lock poisoned"),
                remote_addr: s.remote_addr.clone(),
            })
            .collect()
    }

    /// Serialize and deliver a message to the agent's live session.
    /// Returns whether delivery was attempted successfully.
    pub fn send_to_agent(&self, agent_id: &str, message: &PlaneMessage) -> bool {
        let sessions = self.sessions.read().expect("session lock poisoned");
        match sessions.get(agent_id) {
            Some(session) => session
                .tx
                .send(SessionCommand::Frame(message.to_frame()))
                .is_ok(),
            None => false,
        }
    }

    /// Typed wrapper relaying an operator decision back to the worker.
    pub fn send_approval_response(
        &self,
        agent_id: &str,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> bool {
        self.send_to_agent(
            agent_id,
            &PlaneMessage::ApprovalResponse {
                request_id: request_id.to_string(),
                approved,
                reason,
            },
        )
    }

    /// Close every session with code 1001 and stop accepting upgrades.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        let drained: Vec<(String, Arc<Session>)> = self
            .sessions
            .write()
            .expect("session lock poisoned")
            .drain()
            .collect();
        for (agent_id, session) in drained {
            let _ = session.tx.send(SessionCommand::Close {
                code: CLOSE_GOING_AWAY,
                reason: "server shutting down",
            });
            self.fleet
                .update_agent_connection(&agent_id, AgentConnection::Offline, None);
        }
        info!("control plane closed");
    }

    async fn handle_connection(self: Arc<Self>, socket: WebSocket, agent_id: String, addr: String) {
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id: session_id,
            tx,
            connected_at: Utc::now(),
            last_heartbeat: Mutex::new(None),
            remote_addr: addr.clone(),
        });

        // New connection wins: displace any previous session for this id.
        let displaced = self
            .sessions
            .write()
            .expect("session lock poisoned")
            .insert(agent_id.clone(), Arc::clone(&session));
        if let Some(old) = displaced {
            debug!(agent_id = %agent_id, "displacing previous session");
            let _ = old.tx.send(SessionCommand::Close {
                code: CLOSE_REPLACED,
                reason: CLOSE_REPLACED_REASON,
            });
        }

        self.fleet
            .update_agent_connection(&agent_id, AgentConnection::Online, Some(addr.clone()));
        info!(agent_id = %agent_id, remote_addr = %addr, "worker connected");

        let (mut sender, mut receiver) = socket.split();

        let send_task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SessionCommand::Frame(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    SessionCommand::Close { code, reason } => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        let server = Arc::clone(&self);
        let session_for_recv = Arc::clone(&session);
        let recv_agent_id = agent_id.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = receiver.next().await {
                match message {
                    Message::Text(text) => {
                        server.dispatch_frame(&recv_agent_id, &session_for_recv, text.as_str());
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        });

        tokio::select! {
            _ = send_task => {}
            _ = recv_task => {}
        }

        // Only deregister if this socket still owns the slot; the
        // replacement path may already have rewritten ownership.
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        if sessions.get(&agent_id).is_some_and(|s| s.id == session_id) {
            sessions.remove(&agent_id);
            drop(sessions);
            self.fleet
                .update_agent_connection(&agent_id, AgentConnection::Offline, None);
            info!(agent_id = %agent_id, "worker disconnected");
        }
    }

    /// Parse and dispatch one inbound frame; malformed frames drop silently.
    fn dispatch_frame(&self, agent_id: &str, session: &Session, text: &str) {
        let Some(message) = WorkerMessage::from_frame(text) else {
            debug!(agent_id = %agent_id, "dropping malformed frame");
            return;
        };

        match message {
            WorkerMessage::Heartbeat {
                timestamp,
                uptime_secs,
                ..
            } => {
                *session.last_heartbeat.lock().expect("session lock poisoned") = Some(timestamp);
                self.fleet.update_heartbeat(agent_id, timestamp, uptime_secs);
            }
            WorkerMessage::Status { report, .. } => {
                self.fleet.update_agent_status(agent_id, report);
            }
            WorkerMessage::Action { entry, .. } => {
                self.fleet.record_action(agent_id, entry);
            }
            WorkerMessage::ApprovalRequest { request, .. } => {
                self.approvals.add_request(agent_id, request);
            }
            WorkerMessage::Error { message, .. } => {
                warn!(agent_id = %agent_id, error = %message, "worker reported error");
                self.fleet.record_error(agent_id, message);
            }
        }
    }
}

/// WebSocket admission: bearer token (header or `?token=`) and a non-empty
/// `?agentId=` are required before any protocol data flows.
pub async fn ws_upgrade(
    State(state): State<ApiState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let server = Arc::clone(&state.server);

    if !server.accepting.load(Ordering::Acquire) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    if !server.token.is_empty() {
        let presented = bearer_token(&headers)
            .or_else(|| params.get("token").map(String::as_str))
            .unwrap_or_default();
        if presented != server.token {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let agent_id = params.get("agentId").cloned().unwrap_or_default();
    if agent_id.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    ws.on_upgrade(move |socket| server.handle_connection(socket, agent_id, addr.to_string()))
}

/// The token carried in an `Authorization: Bearer …` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
