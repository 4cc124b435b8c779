// ABOUTME: Entry point of the netlab operator CLI
// ABOUTME: Loads .env, sets up logging and dispatches sandbox commands

use clap::Parser;
use colored::*;
use netlab_sandbox::OrchestratorError;
use std::process;

mod cli;

use cli::sandbox::SandboxCommands;

/// Exit status for "another operation holds this sandbox"
const EXIT_CONFLICT: i32 = 2;

#[derive(Parser)]
#[command(name = "netlab")]
#[command(about = "netlab - per-user lab sandbox orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: SandboxCommands,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    if let Err(e) = cli.command.execute().await {
        let conflict = e
            .downcast_ref::<OrchestratorError>()
            .is_some_and(OrchestratorError::is_conflict);

        if conflict {
            eprintln!(
                "{} {}. Try again later.",
                "Busy:".yellow().bold(),
                e
            );
            process::exit(EXIT_CONFLICT);
        }

        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}
