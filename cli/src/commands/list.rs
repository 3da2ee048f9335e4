//! List every agent in the fleet.

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::client::ApiClient;
use crate::output::OutputContext;

/// Run the list command.
///
/// # Errors
///
/// Returns an error when the control plane cannot be reached.
pub async fn run(ctx: &OutputContext) -> Result<()> {
    let response = ApiClient::from_env().get("/dashboard/agents").await?;

    let agents = response["agents"].as_array().cloned().unwrap_or_default();
    if agents.is_empty() {
        ctx.line("no agents registered");
    }
    for agent in &agents {
        let online = agent["connection"].as_str() == Some("online");
        let dot = if online {
            "●".green().to_string()
        } else {
            "●".red().to_string()
        };
        ctx.line(format!(
            "{dot} {}  {}  actions={} spend=${:.2}",
            agent["agentId"].as_str().unwrap_or("?"),
            agent["name"].as_str().unwrap_or("?"),
            agent["totalActions"].as_u64().unwrap_or(0),
            agent["totalSpend"].as_f64().unwrap_or(0.0),
        ));
    }
    ctx.value(&response);
    Ok(())
}
