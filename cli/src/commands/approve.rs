//! Human-in-the-loop approval handling from the terminal.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::client::ApiClient;
use crate::output::OutputContext;

#[derive(Args)]
pub struct ApproveArgs {
    /// Approve the pending request with this id
    #[arg(long, value_name = "ID", conflicts_with = "deny")]
    pub approve: Option<String>,

    /// Deny the pending request with this id
    #[arg(long, value_name = "ID")]
    pub deny: Option<String>,
}

/// Run the approve command. With no flags, lists the pending queue.
///
/// # Errors
///
/// Returns an error when the control plane cannot be reached or the
/// request id is unknown.
pub async fn run(ctx: &OutputContext, args: &ApproveArgs) -> Result<()> {
    let client = ApiClient::from_env();

    let (id, approved) = match (&args.approve, &args.deny) {
        (Some(id), _) => (id, true),
        (_, Some(id)) => (id, false),
        (None, None) => {
            let response = client.get("/dashboard/approvals").await?;
            let approvals = response["approvals"].as_array().cloned().unwrap_or_default();
            if approvals.is_empty() {
                ctx.line("no pending approvals");
            }
            for entry in &approvals {
                let amount = entry["amount"]
                    .as_f64()
                    .map(|a| format!(" ${a:.2}"))
                    .unwrap_or_default();
                ctx.line(format!(
                    "{}  [{}]{}  {}  (agent {}, expires {})",
                    entry["id"].as_str().unwrap_or("?"),
                    entry["category"].as_str().unwrap_or("?"),
                    amount,
                    entry["description"].as_str().unwrap_or(""),
                    entry["agentId"].as_str().unwrap_or("?"),
                    entry["expiresAt"].as_str().unwrap_or("?"),
                ));
            }
            ctx.value(&response);
            return Ok(());
        }
    };

    let response = client
        .post(
            &format!("/dashboard/approvals/{id}/respond"),
            &json!({"approved": approved, "respondedBy": "cli"}),
        )
        .await?;
    ctx.line(format!(
        "{} {id}",
        if approved { "approved" } else { "denied" }
    ));
    ctx.value(&response);
    Ok(())
}
