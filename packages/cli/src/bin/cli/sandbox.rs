// ABOUTME: CLI commands driving the sandbox orchestrator (launch, stop, status, profiles)
// ABOUTME: Wires Docker, SQLite and S3 from the environment and prints results

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use netlab_sandbox::{
    ContainerEngine, Deployment, DockerEngine, Orchestrator, PkiIssuer, RuntimeDriver, S3Store,
    SandboxConfig, SandboxRecord, SandboxStore, StoreOptions, SystemClock, VpnPlatform,
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Apply database migrations
    Migrate,

    /// Lock a user's sandbox and deploy a chapter into it
    Launch {
        /// User id
        #[arg(long)]
        user: i64,

        /// Chapter the descriptor belongs to
        #[arg(long)]
        chapter: String,

        /// Deployment descriptor (JSON)
        #[arg(long)]
        descriptor: PathBuf,
    },

    /// Tear down a user's sandbox
    Stop {
        /// User id
        #[arg(long)]
        user: i64,
    },

    /// Tear down every ready sandbox
    StopAll {
        /// Only sandboxes running this chapter
        #[arg(long)]
        chapter: Option<String>,
    },

    /// Show a user's sandbox record
    Status {
        /// User id
        #[arg(long)]
        user: i64,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print a download link for a user's VPN client profile
    ProfileUrl {
        /// User id
        #[arg(long)]
        user: i64,

        /// win or linux
        #[arg(long, default_value = "linux")]
        platform: VpnPlatform,
    },
}

impl SandboxCommands {
    pub async fn execute(&self) -> Result<()> {
        match self {
            SandboxCommands::Migrate => migrate_command().await,
            SandboxCommands::Launch {
                user,
                chapter,
                descriptor,
            } => launch_command(*user, chapter, descriptor).await,
            SandboxCommands::Stop { user } => stop_command(*user).await,
            SandboxCommands::StopAll { chapter } => stop_all_command(chapter.as_deref()).await,
            SandboxCommands::Status { user, json } => status_command(*user, *json).await,
            SandboxCommands::ProfileUrl { user, platform } => {
                profile_url_command(*user, *platform).await
            }
        }
    }
}

async fn build_orchestrator() -> Result<Orchestrator> {
    let config = SandboxConfig::from_env().context("Invalid configuration")?;

    let store = SandboxStore::connect(&config.database_url, &config.store)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    store.migrate().await.context("Failed to apply migrations")?;

    let engine = DockerEngine::new().context("Failed to connect to Docker")?;
    if !engine.is_available().await {
        bail!("Docker daemon is not responding");
    }
    let objects = S3Store::connect(&config.s3)
        .await
        .context("Failed to configure object storage")?;

    let runtime = RuntimeDriver::new(Arc::new(engine), config.runtime);
    let pki = PkiIssuer::new(config.pki, Arc::new(objects), Arc::new(SystemClock));

    Ok(Orchestrator::new(store, runtime, pki))
}

fn load_descriptor(path: &Path) -> Result<Deployment> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read descriptor {}", path.display()))?;
    let deployment: Deployment = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse descriptor {}", path.display()))?;
    deployment
        .validate()
        .with_context(|| format!("Invalid descriptor {}", path.display()))?;
    Ok(deployment)
}

async fn migrate_command() -> Result<()> {
    let url = env::var(netlab_config::DATABASE_URL)
        .unwrap_or_else(|_| netlab_config::DEFAULT_DATABASE_URL.to_string());

    let store = SandboxStore::connect(&url, &StoreOptions::default())
        .await
        .with_context(|| format!("Failed to open database {}", url))?;
    store.migrate().await.context("Failed to apply migrations")?;

    println!("{} Migrations applied to {}", "✓".green(), url);
    Ok(())
}

async fn launch_command(user_id: i64, chapter: &str, descriptor: &Path) -> Result<()> {
    let deployment = load_descriptor(descriptor)?;
    let orchestrator = build_orchestrator().await?;

    info!("Launching chapter {} for user {}", chapter, user_id);
    let record = orchestrator.start(user_id, chapter, &deployment).await?;

    println!(
        "{} Sandbox for user {} is ready on port {}",
        "✓".green(),
        record.user_id,
        record.port.to_string().bold()
    );
    Ok(())
}

async fn stop_command(user_id: i64) -> Result<()> {
    let orchestrator = build_orchestrator().await?;
    orchestrator.stop(user_id).await?;

    println!("{} Sandbox for user {} stopped", "✓".green(), user_id);
    Ok(())
}

async fn stop_all_command(chapter: Option<&str>) -> Result<()> {
    let orchestrator = build_orchestrator().await?;
    let stopped = orchestrator.stop_all(chapter).await?;

    println!("{} Stopped {} sandboxes", "✓".green(), stopped);
    Ok(())
}

async fn status_command(user_id: i64, json: bool) -> Result<()> {
    let orchestrator = build_orchestrator().await?;

    let Some(record) = orchestrator.status(user_id).await? else {
        println!("{}", format!("No sandbox for user {}", user_id).yellow());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(())
}

async fn profile_url_command(user_id: i64, platform: VpnPlatform) -> Result<()> {
    let orchestrator = build_orchestrator().await?;
    let url = orchestrator.profile_url(user_id, platform).await?;

    println!("{}", url);
    Ok(())
}

fn print_record(record: &SandboxRecord) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["User", "Port", "Chapter", "State", "VPN", "Updated"]);
    table.add_row(vec![
        record.user_id.to_string(),
        record.port.to_string(),
        record.chapter.clone().unwrap_or_else(|| "-".to_string()),
        record.state.to_string(),
        if record.vpn.is_some() { "issued" } else { "-" }.to_string(),
        record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    ]);

    println!("{table}");
}
