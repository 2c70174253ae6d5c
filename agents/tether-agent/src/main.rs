//! Tether Agent CLI Entry Point
//!
//! This is the main entry point for the Tether Agent binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tether_agent::agent::controller::AgentController;
use tether_agent::agent::registry::AgentRegistry;
use tether_agent::cache::{ContentCache, HttpSource};
use tether_agent::cli::config::{Config, LoggingConfig};
use tether_agent::connection::link::{ControlLink, LinkArtifactSource, LinkHandle};
use tether_agent::connection::websocket::WebSocketClientBuilder;
use tether_agent::runtime::adapter::RuntimeHost;
use tether_agent::runtime::docker::DockerHost;
use tether_agent::runtime::memory::InMemoryHost;

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(author, version, about = "Tether Agent - remote management agent for deployable units")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/agent.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start,
    /// Show agent status
    Status,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        show_version();
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Start => start_agent(config).await?,
        Commands::Status => show_status(&config).await?,
        Commands::Version => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        eprintln!(
            "Config file {} not found, using defaults",
            path.display()
        );
        Ok(Config::default_config())
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder
            .pretty()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

async fn build_host(config: &Config) -> Result<Arc<dyn RuntimeHost>> {
    match config.runtime.runtime_type.as_str() {
        "memory" => {
            info!("Using in-memory runtime host");
            Ok(Arc::new(InMemoryHost::new()))
        }
        _ => {
            let docker = DockerHost::with_socket(&config.runtime.docker_socket)
                .context("Failed to initialize Docker host")?
                .with_network(config.runtime.default_network.clone());

            let version = docker
                .version()
                .await
                .context("Failed to get Docker version")?;
            info!(docker_version = %version, "Docker runtime initialized");

            docker
                .adopt_existing()
                .await
                .context("Failed to list managed containers")?;

            Ok(Arc::new(docker))
        }
    }
}

async fn start_agent(config: Config) -> Result<()> {
    info!(agent = %config.agent_name, agent_id = %config.agent_id, "Starting Tether Agent...");

    let host = build_host(&config).await?;

    let (link, outbox) = LinkHandle::channel(config.control_plane.outbox_capacity);
    let control_link: Arc<dyn ControlLink> = Arc::new(link.clone());

    let artifacts = Arc::new(LinkArtifactSource::new(
        control_link.clone(),
        config.artifacts.fetch_timeout(),
    ));
    let mut cache = ContentCache::new(&config.artifacts.cache_dir);
    if let Some(base_url) = &config.artifacts.http_base_url {
        info!(base_url = %base_url, "Using HTTP artifact store");
        cache = cache.with_source(Arc::new(HttpSource::new(base_url)));
    }
    let cache = Arc::new(cache.with_source(artifacts.clone()));

    let registry = AgentRegistry::new();
    let controller = AgentController::new(&config.agent_name, host.clone(), cache, control_link)
        .with_refresh_timeout(config.refresh.timeout())
        .with_registry(registry.clone())
        .start();

    if controller.forward_host_events().is_some() {
        info!("Forwarding host events to supervisor");
    }

    tokio::spawn({
        let controller = controller.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, closing agent");
                    if let Err(e) = controller.close().await {
                        error!(error = %e, "Agent teardown failed");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
            }
        }
    });

    let ws_url = format!("{}/ws/agent/{}", config.control_plane.url, config.agent_id);
    let client = WebSocketClientBuilder::new(
        &ws_url,
        &config.agent_id,
        controller,
        host,
        link,
        artifacts,
    )
    .api_key(config.control_plane.api_key.clone())
    .reconnect_interval_ms(config.control_plane.reconnect_interval_ms)
    .heartbeat_interval_secs(config.control_plane.heartbeat_interval_secs)
    .build();

    client.run(outbox).await?;

    info!(registered = registry.len(), "Tether Agent stopped");
    Ok(())
}

async fn show_status(config: &Config) -> Result<()> {
    println!("Agent: {} ({})", config.agent_name, config.agent_id);
    println!("  Supervisor: {}", config.control_plane.url);

    match config.runtime.runtime_type.as_str() {
        "memory" => println!("  Runtime: in-memory"),
        _ => match DockerHost::with_socket(&config.runtime.docker_socket) {
            Ok(docker) => match docker.version().await {
                Ok(version) => {
                    println!("  Runtime: {} (connected)", version);
                    match docker.adopt_existing().await {
                        Ok(count) => println!("  Managed units: {}", count),
                        Err(_) => println!("  Managed units: unknown"),
                    }
                }
                Err(e) => println!("  Runtime: error - {}", e),
            },
            Err(e) => println!("  Runtime: not available - {}", e),
        },
    }

    let cached = std::fs::read_dir(&config.artifacts.cache_dir)
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0);
    println!(
        "  Artifact cache: {} ({} entries)",
        config.artifacts.cache_dir.display(),
        cached
    );

    Ok(())
}

fn show_version() {
    println!("tether-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Remote management agent for deployable units");
    println!();
    println!("Features:");
    println!("  - Desired-state reconciliation");
    println!("  - Content-addressed artifact cache");
    println!("  - Docker and in-memory runtime hosts");
    println!("  - Output redirection to supervisor or local socket");
}
