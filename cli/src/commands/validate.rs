//! Validate a manifest without touching any provider.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::commands::load_manifest;
use crate::output::OutputContext;

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the manifest (JSON or YAML)
    pub manifest_path: PathBuf,
}

/// Run the validate command.
///
/// # Errors
///
/// Returns an error (non-zero exit) when the manifest is rejected.
pub fn run(ctx: &OutputContext, args: &ValidateArgs) -> Result<()> {
    let manifest = load_manifest(&args.manifest_path)?;
    ctx.line(format!(
        "manifest valid: {} ({})",
        manifest.identity.name, manifest.identity.id
    ));
    ctx.value(&json!({
        "valid": true,
        "agentId": manifest.identity.id,
        "name": manifest.identity.name,
    }));
    Ok(())
}
