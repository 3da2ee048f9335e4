//! Tear a worker down end to end.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::OutputContext;

#[derive(Args)]
pub struct DestroyArgs {
    /// The agent id to destroy
    pub agent_id: String,
}

/// Run the destroy command.
///
/// # Errors
///
/// Returns an error when the control plane cannot be reached.
pub async fn run(ctx: &OutputContext, args: &DestroyArgs) -> Result<()> {
    let response = ApiClient::from_env()
        .delete(&format!("/dashboard/agents/{}", args.agent_id))
        .await?;

    let destroyed = response["instanceDestroyed"].as_bool().unwrap_or(false);
    ctx.line(format!(
        "agent {} removed (instance destroyed: {destroyed})",
        args.agent_id
    ));
    ctx.value(&response);
    Ok(())
}
