//! Worker-side session to the control plane.
//!
//! A long-lived client with an explicit state machine: `disconnected →
//! connecting → connected → disconnected`, with `closed` as a sink state
//! reached only by explicit local shutdown. Reconnection is purely
//! client-driven with exponential backoff capped at 60 seconds, reset on
//! every successful open. Approval requests correlate over the session by
//! request id and deny by default when the 5-minute timeout fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tracing::{debug, info, warn};

use moltagent_common::manifest::{Goal, InlineDocument, Manifest};
use moltagent_common::protocol::{PlaneMessage, WorkerMessage};
use moltagent_common::types::{ActionLogEntry, ApprovalRequest, StatusReport};

/// Backoff base for reconnect attempt 1.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// How long an in-flight approval waits before denying by default.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Session lifecycle as observed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// The operator's (or the timeout's) answer to an approval request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl ApprovalDecision {
    fn denied(reason: &str) -> Self {
        Self {
            approved: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Hooks the embedding worker runtime installs for operator commands.
/// The bridge logs every command; durable effects belong to the runtime.
pub trait CommandHandler: Send + Sync {
    fn on_update_config(&self, _config: Value) {}
    fn on_update_goals(&self, _goals: Vec<Goal>) {}
    fn on_inject_knowledge(&self, _documents: Vec<InlineDocument>) {}
    fn on_send_message(&self, _content: String, _channel: Option<String>) {}
}

/// Connection settings, normally taken from the manifest's `controlPlane`
/// section.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub agent_id: String,
    pub url: String,
    pub token: String,
    pub heartbeat_interval: Duration,
    pub approval_timeout: Duration,
    /// `restart`/`shutdown` terminate the process (exit code 0, supervisor
    /// restarts on the former). Tests disable this to observe the close.
    pub exit_on_lifecycle: bool,
}

impl BridgeConfig {
    #[must_use]
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            agent_id: manifest.identity.id.to_string(),
            url: manifest.control_plane.url.clone(),
            token: manifest.control_plane.token.clone(),
            heartbeat_interval: Duration::from_secs(manifest.control_plane.heartbeat_interval_secs),
            approval_timeout: APPROVAL_TIMEOUT,
            exit_on_lifecycle: true,
        }
    }
}

/// Exponential reconnect delay: `min(1s · 2^(n-1), 60s)` for attempt `n ≥ 1`.
#[must_use]
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    BACKOFF_CAP.min(BACKOFF_BASE * 2u32.pow(exponent))
}

struct Inner {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    closed: AtomicBool,
    session_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending_approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    handler: RwLock<Option<Arc<dyn CommandHandler>>>,
    started_at: Instant,
    close_tx: watch::Sender<bool>,
}

/// The worker's resilient link to the control plane.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

enum SessionEnd {
    /// The socket opened and later dropped; backoff restarts from 1.
    WasConnected,
    /// The dial itself failed.
    DialFailed,
}

impl Bridge {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BridgeState::Disconnected),
                closed: AtomicBool::new(false),
                session_tx: Mutex::new(None),
                pending_approvals: Mutex::new(HashMap::new()),
                handler: RwLock::new(None),
                started_at: Instant::now(),
                close_tx: watch::channel(false).0,
            }),
        }
    }

    /// Install the command handler; replaces any previous one.
    pub fn set_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self.inner.handler.write().expect("bridge lock poisoned") = Some(handler);
    }

    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.inner.state.lock().expect("bridge lock poisoned")
    }

    fn set_state(&self, state: BridgeState) {
        *self.inner.state.lock().expect("bridge lock poisoned") = state;
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Enter the sink state and tear down the current session. Reconnects
    /// are suppressed from here on; in-flight approvals resolve to deny on
    /// their own timeout.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.set_state(BridgeState::Closed);
        self.inner
            .session_tx
            .lock()
            .expect("bridge lock poisoned")
            .take();
        let _ = self.inner.close_tx.send(true);
    }

    /// Run the reconnect loop until [`Bridge::close`] is called.
    pub async fn run(&self) {
        let mut closed_rx = self.inner.close_tx.subscribe();
        let mut attempt: u32 = 0;
        loop {
            if self.is_closed() {
                break;
            }
            self.set_state(BridgeState::Connecting);
            let end = self.connect_and_run().await;
            if self.is_closed() {
                break;
            }
            self.set_state(BridgeState::Disconnected);

            attempt = match end {
                Ok(SessionEnd::WasConnected) => 1,
                Ok(SessionEnd::DialFailed) | Err(_) => attempt.saturating_add(1).max(1),
            };
            let delay = reconnect_delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "reconnecting to control plane");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = closed_rx.changed() => break,
            }
        }
        self.set_state(BridgeState::Closed);
    }

    async fn connect_and_run(&self) -> Result<SessionEnd> {
        let config = &self.inner.config;
        let separator = if config.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}agentId={}", config.url, separator, config.agent_id);

        let mut request = url
            .into_client_request()
            .context("building websocket request")?;
        if !config.token.is_empty() {
            request.headers_mut().insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", config.token))
                    .context("invalid control-plane token")?,
            );
        }

        let (socket, _response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "dial failed");
                return Ok(SessionEnd::DialFailed);
            }
        };

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self
            .inner
            .session_tx
            .lock()
            .expect("bridge lock poisoned") = Some(tx.clone());
        self.set_state(BridgeState::Connected);
        info!(url = %config.url, "connected to control plane");

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let heartbeat = {
            let bridge = self.clone();
            let interval = config.heartbeat_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    bridge.send_heartbeat();
                }
            })
        };

        let mut closed_rx = self.inner.close_tx.subscribe();
        loop {
            if self.is_closed() {
                break;
            }
            let message = tokio::select! {
                _ = closed_rx.changed() => break,
                message = stream.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message {
                Ok(Message::Text(text)) => {
                    if self.handle_frame(text.as_str()) {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "server closed session");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "socket error");
                    break;
                }
            }
        }

        heartbeat.abort();
        self.inner
            .session_tx
            .lock()
            .expect("bridge lock poisoned")
            .take();
        writer.abort();
        Ok(SessionEnd::WasConnected)
    }

    /// Dispatch one inbound frame. Returns `true` when the session should
    /// end (local shutdown via a lifecycle command with exits disabled).
    fn handle_frame(&self, text: &str) -> bool {
        let Some(message) = PlaneMessage::from_frame(text) else {
            debug!("dropping malformed frame");
            return false;
        };

        let handler = self
            .inner
            .handler
            .read()
            .expect("bridge lock poisoned")
            .clone();
        match message {
            PlaneMessage::ApprovalResponse {
                request_id,
                approved,
                reason,
            } => {
                let sender = self
                    .inner
                    .pending_approvals
                    .lock()
                    .expect("bridge lock poisoned")
                    .remove(&request_id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(ApprovalDecision { approved, reason });
                    }
                    None => debug!(request_id = %request_id, "approval response for unknown request"),
                }
            }
            PlaneMessage::UpdateConfig { config } => {
                info!("received config update");
                if let Some(h) = handler {
                    h.on_update_config(config);
                }
            }
            PlaneMessage::UpdateGoals { goals } => {
                info!(count = goals.len(), "received goal update");
                if let Some(h) = handler {
                    h.on_update_goals(goals);
                }
            }
            PlaneMessage::InjectKnowledge { documents } => {
                info!(count = documents.len(), "received knowledge injection");
                if let Some(h) = handler {
                    h.on_inject_knowledge(documents);
                }
            }
            PlaneMessage::SendMessage { content, channel } => {
                info!(channel = ?channel, "received outbound message request");
                if let Some(h) = handler {
                    h.on_send_message(content, channel);
                }
            }
            PlaneMessage::Restart => {
                info!("restart requested by control plane");
                return self.lifecycle_exit();
            }
            PlaneMessage::Shutdown => {
                info!("shutdown requested by control plane");
                return self.lifecycle_exit();
            }
            PlaneMessage::Ping => debug!("ping from control plane"),
        }
        false
    }

    fn lifecycle_exit(&self) -> bool {
        if self.inner.config.exit_on_lifecycle {
            // The supervisor unit decides whether a fresh process comes up.
            std::process::exit(0);
        }
        self.close();
        true
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    fn send_frame(&self, message: &WorkerMessage) -> bool {
        let guard = self.inner.session_tx.lock().expect("bridge lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(message.to_frame()).is_ok(),
            None => {
                debug!("dropping outbound frame, not connected");
                false
            }
        }
    }

    fn send_heartbeat(&self) -> bool {
        self.send_frame(&WorkerMessage::Heartbeat {
            agent_id: self.inner.config.agent_id.clone(),
            timestamp: Utc::now(),
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
        })
    }

    /// Send a full status report.
    pub fn send_status(&self, report: StatusReport) -> bool {
        self.send_frame(&WorkerMessage::Status {
            agent_id: self.inner.config.agent_id.clone(),
            report,
        })
    }

    /// Log an action with the control plane.
    pub fn send_action(&self, entry: ActionLogEntry) -> bool {
        self.send_frame(&WorkerMessage::Action {
            agent_id: self.inner.config.agent_id.clone(),
            entry,
        })
    }

    /// Report a worker-side error.
    pub fn send_error(&self, message: String) -> bool {
        self.send_frame(&WorkerMessage::Error {
            agent_id: self.inner.config.agent_id.clone(),
            message,
        })
    }

    /// Ask a human for permission and wait for the verdict.
    ///
    /// Registers a one-shot completion keyed by the request id, sends the
    /// `approval_request` frame, and resolves when a matching
    /// `approval_response` arrives — or denies when the timeout fires.
    pub async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        let request_id = request.id.clone();
        let (sender, receiver) = oneshot::channel();
        self.inner
            .pending_approvals
            .lock()
            .expect("bridge lock poisoned")
            .insert(request_id.clone(), sender);

        let sent = self.send_frame(&WorkerMessage::ApprovalRequest {
            agent_id: self.inner.config.agent_id.clone(),
            request,
        });
        if !sent {
            warn!(request_id = %request_id, "approval request queued while disconnected");
        }

        let decision = match tokio::time::timeout(self.inner.config.approval_timeout, receiver).await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => ApprovalDecision::denied("approval channel dropped"),
            Err(_) => ApprovalDecision::denied("approval timed out"),
        };

        self.inner
            .pending_approvals
            .lock()
            .expect("bridge lock poisoned")
            .remove(&request_id);
        decision
    }
}
