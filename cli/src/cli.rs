//! CLI argument parsing with clap derive

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use moltagent_control_plane::config::OrchestratorConfig;

use crate::commands;
use crate::output::OutputContext;

/// Provision and steer fleets of autonomous agent workers
#[derive(Parser)]
#[command(name = "moltagent", version, propagate_version = true)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate a manifest, deploy a VPS, and register the agent
    Provision(commands::provision::ProvisionArgs),

    /// List every agent known to the fleet
    List,

    /// Shut a worker down, destroy its VPS, and drop the fleet record
    Destroy(commands::destroy::DestroyArgs),

    /// Show the fleet summary (or this worker's own state in worker mode)
    Status,

    /// Validate a manifest without deploying anything
    Validate(commands::validate::ValidateArgs),

    /// List pending approvals, or resolve one
    Approve(commands::approve::ApproveArgs),
}

impl Cli {
    /// Execute the parsed command, or fall back to the mode selected by
    /// the `MOLTAGENT_*` environment (worker / orchestrator / hybrid).
    ///
    /// # Errors
    ///
    /// Returns an error when the command fails; the process exit code is
    /// non-zero in that case.
    pub async fn run(self) -> Result<()> {
        let ctx = OutputContext::new(self.json, self.quiet);

        match self.command {
            Some(Command::Validate(args)) => commands::validate::run(&ctx, &args),
            Some(Command::Provision(args)) => commands::provision::run(&ctx, args).await,
            Some(Command::List) => commands::list::run(&ctx).await,
            Some(Command::Destroy(args)) => commands::destroy::run(&ctx, &args).await,
            Some(Command::Status) => commands::status::run(&ctx).await,
            Some(Command::Approve(args)) => commands::approve::run(&ctx, &args).await,
            None => run_mode().await,
        }
    }
}

/// No subcommand: pick the long-running mode from the environment.
async fn run_mode() -> Result<()> {
    let config = OrchestratorConfig::from_env()?;
    let worker = config.worker_enabled();
    let orchestrator = config.orchestrator_enabled();

    match (worker, orchestrator) {
        (true, false) => crate::worker::run(&config).await,
        (false, true) => moltagent_control_plane::run_orchestrator(config).await,
        (true, true) => {
            // Hybrid: one process serving the control plane while also
            // running a local worker against it.
            let worker_config = config.clone();
            let orchestrator = tokio::spawn(moltagent_control_plane::run_orchestrator(config));
            let worker = crate::worker::run(&worker_config).await;
            orchestrator
                .await
                .context("orchestrator task panicked")??;
            worker
        }
        (false, false) => anyhow::bail!(
            "no command given and no mode configured; set MOLTAGENT_MANIFEST (worker) or \
             MOLTAGENT_CONTROL_PLANE=1 / MOLTAGENT_API_TOKEN (orchestrator), or run \
             'moltagent --help'"
        ),
    }
}
