//! Status command: fleet summary in orchestrator mode, self status in
//! worker mode.

use anyhow::Result;
use serde_json::json;

use crate::client::ApiClient;
use crate::commands::load_manifest;
use crate::output::OutputContext;

/// Run the status command.
///
/// # Errors
///
/// Returns an error when neither a worker manifest nor a reachable
/// control plane is available.
pub async fn run(ctx: &OutputContext) -> Result<()> {
    if let Ok(path) = std::env::var("MOLTAGENT_MANIFEST") {
        let manifest = load_manifest(std::path::Path::new(&path))?;
        ctx.line(format!(
            "worker {} ({})",
            manifest.identity.name, manifest.identity.id
        ));
        ctx.line(format!("  control plane: {}", manifest.control_plane.url));
        ctx.line(format!("  goals: {}", manifest.goals.len()));
        ctx.value(&json!({
            "mode": "worker",
            "agentId": manifest.identity.id,
            "name": manifest.identity.name,
            "controlPlane": manifest.control_plane.url,
        }));
        return Ok(());
    }

    let response = ApiClient::from_env().get("/dashboard/overview").await?;
    let fleet = &response["fleet"];
    let approvals = &response["approvals"];
    ctx.line(format!(
        "fleet: {} agents ({} online, {} offline)",
        fleet["totalAgents"].as_u64().unwrap_or(0),
        fleet["online"].as_u64().unwrap_or(0),
        fleet["offline"].as_u64().unwrap_or(0),
    ));
    ctx.line(format!(
        "actions: {} total, spend ${:.2}",
        fleet["totalActions"].as_u64().unwrap_or(0),
        fleet["totalSpend"].as_f64().unwrap_or(0.0),
    ));
    ctx.line(format!(
        "approvals: {} pending, {} approved today",
        approvals["pending"].as_u64().unwrap_or(0),
        approvals["approvedToday"].as_u64().unwrap_or(0),
    ));
    ctx.value(&response);
    Ok(())
}
