//! termbroker - WebSocket terminal broker.
//!
//! Usage:
//!   termbroker serve [--port 8080] [--commands commands.json]
//!   termbroker check-commands <file>     # Validate a command catalog

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use termbroker::catalog::CommandCatalog;
use termbroker::config::{BrokerConfig, ServeArgs};
use termbroker::http_server;
use termbroker::BrokerError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "termbroker")]
#[command(about = "WebSocket terminal broker")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the broker
    Serve(ServeArgs),
    /// Validate a command catalog and list what it allows
    CheckCommands {
        /// Path to the JSON catalog
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Serve(serve) => match BrokerConfig::from_args(serve) {
            Ok(config) => http_server::run_server(config).await,
            Err(e) => Err(e),
        },
        Commands::CheckCommands { path } => check_commands(&path),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn check_commands(path: &std::path::Path) -> Result<(), BrokerError> {
    let catalog = CommandCatalog::load(path)?;
    for (id, system) in &catalog.systems {
        println!(
            "system {:<20} start: {}",
            id,
            system.start_command.as_deref().unwrap_or("-")
        );
    }
    for (name, step) in &catalog.steps {
        println!("step   {:<20} {}", name, step.command);
    }
    Ok(())
}
