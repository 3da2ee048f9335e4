//! Deploy a new worker from a manifest.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::client::ApiClient;
use crate::commands::load_manifest;
use crate::output::OutputContext;

#[derive(Args)]
pub struct ProvisionArgs {
    /// Path to the manifest (JSON or YAML)
    pub manifest_path: PathBuf,

    /// Override the manifest's provider (e.g. `hetzner`, `docker-local`)
    #[arg(long)]
    pub provider: Option<String>,
}

/// Run the provision command.
///
/// # Errors
///
/// Returns an error when validation fails locally or the control plane
/// rejects the deployment.
pub async fn run(ctx: &OutputContext, args: ProvisionArgs) -> Result<()> {
    let mut manifest = load_manifest(&args.manifest_path)?;
    if let Some(provider) = args.provider {
        manifest.resources.provider = provider;
    }

    let body = serde_json::to_value(&manifest).context("serializing manifest")?;
    let response = ApiClient::from_env()
        .post("/dashboard/agents", &body)
        .await?;

    let agent_id = response["agentId"].as_str().unwrap_or_default();
    let instance = &response["instance"];
    ctx.line(format!("provisioned agent {agent_id}"));
    ctx.line(format!(
        "  instance {} on {} ({})",
        instance["id"].as_str().unwrap_or("?"),
        instance["provider"].as_str().unwrap_or("?"),
        instance["ipv4"].as_str().unwrap_or("no ip yet"),
    ));
    ctx.value(&response);
    Ok(())
}
