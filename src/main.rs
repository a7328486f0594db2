//! WolfSync - Action Replication for Database Clusters
//!
//! Connects the configured members, bootstraps each one from the template
//! and replicates writes received over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::api::HttpServer;
use wolfsync::cluster::{ClusterCoordinator, MemberStatus};
use wolfsync::config::WolfSyncConfig;
use wolfsync::member::MariaDbMember;

/// WolfSync - Action Replication for Database Clusters
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join all members and serve the HTTP API until Ctrl+C
    Start,

    /// Join all members once, bootstrapping each from the template
    Sync,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
            run_start(config).await
        }
        Commands::Sync => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
            run_sync(config).await
        }
        Commands::Init { output } => run_init(&output),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<WolfSyncConfig> {
    WolfSyncConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Connect every configured member and join it to a new coordinator.
/// Returns the coordinator and the number of members that failed.
async fn connect_cluster(config: &WolfSyncConfig) -> anyhow::Result<(Arc<ClusterCoordinator>, usize)> {
    let coordinator = Arc::new(ClusterCoordinator::from_config(config));
    coordinator.spawn_event_loop();

    let mut failures = 0;
    let mut tables_resolved = false;

    for member_config in config.join_order() {
        tracing::info!(
            "Connecting to {} at {}:{}...",
            member_config.label,
            member_config.host,
            member_config.port
        );
        let member = match MariaDbMember::connect(member_config).await {
            Ok(m) => Arc::new(m),
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", member_config.label, e);
                failures += 1;
                continue;
            }
        };

        // Table structure comes from the first reachable member, which
        // becomes the template
        if !tables_resolved {
            for table in &config.cluster.tracked_tables {
                match member.table_descriptor(table).await {
                    Ok(descriptor) => coordinator.track_table(descriptor).await,
                    Err(e) => tracing::warn!(
                        "Tracked table {} not readable on {}: {}",
                        table,
                        member_config.label,
                        e
                    ),
                }
            }
            tables_resolved = true;
        }

        match coordinator.join(member).await {
            Ok(outcome) if outcome.is_success() => {
                tracing::info!("{} joined: {:?}", member_config.label, outcome);
            }
            Ok(outcome) => {
                tracing::error!("{} did not converge: {:?}", member_config.label, outcome);
                failures += 1;
            }
            Err(e) => {
                tracing::error!("{} failed to join: {}", member_config.label, e);
                failures += 1;
            }
        }
    }

    Ok((coordinator, failures))
}

/// Run the replication service
async fn run_start(config: WolfSyncConfig) -> anyhow::Result<()> {
    tracing::info!("Starting WolfSync for cluster {}...", config.cluster.label);

    let (coordinator, failures) = connect_cluster(&config).await?;
    let active = coordinator.active_members().await;
    if active.is_empty() {
        coordinator.shutdown().await;
        bail!("no member of cluster {} could be brought online", config.cluster.label);
    }
    if failures > 0 {
        tracing::warn!("{} members are not serving writes", failures);
    }
    tracing::info!("Active members: {}", active.join(", "));

    let api_shutdown = CancellationToken::new();
    let server = HttpServer::new(config.api.clone(), Arc::clone(&coordinator));
    let api_handle = {
        let token = api_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(token).await {
                tracing::error!("HTTP server error: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    api_shutdown.cancel();
    coordinator.shutdown().await;
    if let Err(e) = api_handle.await {
        tracing::warn!("HTTP server task ended abnormally: {}", e);
    }

    tracing::info!("WolfSync shutdown complete");
    Ok(())
}

/// Bootstrap every member once and report
async fn run_sync(config: WolfSyncConfig) -> anyhow::Result<()> {
    let (coordinator, failures) = connect_cluster(&config).await?;
    let summary = coordinator.status().await;
    coordinator.shutdown().await;

    println!("Cluster {}", summary.cluster);
    println!("  Template: {}", summary.template.as_deref().unwrap_or("(none)"));
    for member in &summary.members {
        println!("  {:<16} {}", member.label, member.status);
    }

    let unsynced = summary.members.len() - summary.count(MemberStatus::Active);
    if failures > 0 || unsynced > 0 {
        bail!("{} of {} members failed to synchronize", failures.max(unsynced), config.members.len());
    }
    println!("✓ All members synchronized");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: &PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    WolfSyncConfig::write_sample(output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration file created: {}", output.display());
    println!("\nNext steps:");
    println!("  1. Edit the members and tracked tables");
    println!("  2. Run: wolfsync validate -c {}", output.display());
    println!("  3. Run: wolfsync start -c {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match WolfSyncConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Cluster: {}", config.cluster.label);
            println!(
                "  Template: {}",
                config.cluster.template.as_deref().unwrap_or("(first member)")
            );
            println!("  Tracked tables: {}", config.cluster.tracked_tables.join(", "));
            for member in &config.members {
                println!("  Member {}: {}", member.label, member.settings());
            }
            println!("  API: {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
