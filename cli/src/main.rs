//! MoltAgent CLI - control plane and agent bridge for autonomous worker fleets

use clap::Parser;
use tracing_subscriber::EnvFilter;

use moltagent_cli::cli::Cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    tokio::select! {
        result = cli.run() => {
            if let Err(e) = result {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted");
        }
    }
}
