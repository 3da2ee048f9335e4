//! MoltAgent control plane.
//!
//! One process, cooperative concurrency: many worker sessions multiplexed
//! over a single coherent in-memory model. The [`server`] owns live
//! sessions, the [`fleet`] manager owns durable agent records, the
//! [`approvals`] manager owns the human-gating queue, and the
//! [`provisioner`] owns the live-instance index over pluggable
//! [`providers`]. The orchestrator here wires them together and binds the
//! callback cycle (approvals → server) after construction.

pub mod api;
pub mod approvals;
pub mod bootstrap;
pub mod command_runner;
pub mod config;
pub mod fleet;
pub mod provisioner;
pub mod providers;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use moltagent_common::types::ApprovalState;

use crate::api::ApiState;
use crate::approvals::ApprovalManager;
use crate::config::OrchestratorConfig;
use crate::fleet::FleetManager;
use crate::providers::{DockerProvider, HetznerProvider, ProviderRegistry};
use crate::provisioner::Provisioner;
use crate::server::ControlPlaneServer;

/// Construct every component and wire the post-construction callbacks.
///
/// The cloud backend is registered only when `HETZNER_API_TOKEN` is
/// present; the local-container backend is always available and is the
/// default when no cloud backend exists.
///
/// # Errors
///
/// Returns an error when the data directory cannot be resolved.
pub fn build_state(config: &OrchestratorConfig) -> Result<ApiState> {
    let fleet = Arc::new(FleetManager::load(config.fleet_path()?));
    let approvals = Arc::new(ApprovalManager::new());

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(DockerProvider::new()));
    let default_provider = match std::env::var("HETZNER_API_TOKEN") {
        Ok(token) if !token.is_empty() => {
            registry.register(Arc::new(HetznerProvider::new(token)));
            "hetzner".to_string()
        }
        _ => providers::DOCKER_PROVIDER_NAME.to_string(),
    };
    let provisioner = Arc::new(Provisioner::new(Arc::new(registry), default_provider));

    let token = config.token();
    let server = Arc::new(ControlPlaneServer::new(
        token.clone(),
        Arc::clone(&fleet),
        Arc::clone(&approvals),
    ));

    // Break the approvals→server cycle with a callback bound here: expiry
    // relays a denial to the worker; operator decisions are relayed by the
    // respond endpoint itself.
    let relay_server = Arc::clone(&server);
    approvals.set_on_resolved(Box::new(move |entry| {
        if entry.state == ApprovalState::Expired {
            relay_server.send_approval_response(
                &entry.agent_id,
                &entry.id,
                false,
                Some("approval expired".to_string()),
            );
        }
    }));

    Ok(ApiState {
        server,
        fleet,
        approvals,
        provisioner,
        token,
    })
}

/// Run the orchestrator until ctrl-c: start the background tasks, serve
/// the combined WS + HTTP surface, then close everything down in order.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn run_orchestrator(config: OrchestratorConfig) -> Result<()> {
    let state = build_state(&config)?;
    state.fleet.start_autosave();
    state.approvals.start_expiry_sweep();

    let addr = format!("0.0.0.0:{}", config.cp_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %addr,
        auth = !state.token.is_empty(),
        "control plane listening"
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    };

    let result = api::serve(listener, state.clone(), shutdown).await;

    state.server.close();
    state.approvals.close();
    state.fleet.close()?;
    result
}
