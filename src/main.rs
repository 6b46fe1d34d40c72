use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use communities_relay::{api, Config, RelayState, SqliteStore};

#[derive(Parser)]
#[command(name = "communities-relay")]
#[command(about = "NIP-29 communities relay with tier-gated paid content")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "relay.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Run,
    /// Check configuration and storage, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    config.expand_paths()?;

    init_logging(&config.logging.level)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            config
                .validate()
                .with_context(|| "Configuration validation failed")?;
            run_relay(config).await
        }
        Commands::Check => check_config(&config),
    }
}

async fn run_relay(config: Config) -> Result<()> {
    tracing::info!("Starting communities relay v{}", env!("CARGO_PKG_VERSION"));

    let bind = config.bind_addr()?;
    let relay = RelayState::open(config)
        .await
        .with_context(|| "Failed to open relay state")?;
    tracing::info!("Relay identity: {}", relay.pubkey());
    tracing::info!("Known groups: {}", relay.groups.len());

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    api::serve(listener, relay, async {
        if let Err(e) = wait_for_shutdown().await {
            tracing::error!("Signal handling failed: {}", e);
        }
        tracing::info!("Received shutdown signal, stopping relay...");
    })
    .await
}

fn check_config(config: &Config) -> Result<()> {
    println!("Checking configuration...");

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;
    println!("✓ Configuration is valid");

    let keys = config.keys()?;
    println!("✓ Relay key is valid");
    println!("  Public key: {}", keys.public_key());

    for path in [config.community_db(), config.public_db()] {
        SqliteStore::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        println!("✓ Opened {}", path.display());
    }

    println!("\nRelay is ready to run with these settings.");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        },
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C");
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();

    Ok(())
}
