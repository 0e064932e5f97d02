use anyhow::Result;
use clap::Parser;
use netsentry::capture::PacketSource;
use netsentry::{config, retention, Services};
use tracing::info;

/// Netsentry: passive LAN traffic observer.
#[derive(Parser, Debug)]
#[command(name = "netsentry", version, about)]
struct Cli {
    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the SQLite database file (overrides the config file).
    #[arg(short, long)]
    db: Option<String>,

    /// Interface to sniff (overrides the config file).
    #[arg(short, long)]
    interface: Option<String>,
}

const BANNER: &str = r#"
  _   _      _                  _
 | \ | | ___| |_ ___  ___ _ __ | |_ _ __ _   _
 |  \| |/ _ \ __/ __|/ _ \ '_ \| __| '__| | | |
 | |\  |  __/ |_\__ \  __/ | | | |_| |  | |_| |
 |_| \_|\___|\__|___/\___|_| |_|\__|_|   \__, |
                                         |___/
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netsentry=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    println!("{BANNER}");
    info!(version = env!("CARGO_PKG_VERSION"), "Starting netsentry");

    let mut app_config = if let Some(ref path) = cli.config {
        config::AppConfig::from_file(path)?
    } else {
        config::AppConfig::default()
    };
    if let Some(db) = cli.db {
        app_config.db_path = db;
    }
    if let Some(interface) = cli.interface {
        app_config.capture.interface = Some(interface);
    }
    app_config.validate()?;

    let services = Services::build(app_config).await?;

    retention::start_retention_task(
        services.db.clone(),
        services.config.retention.data_retention_days,
    );

    services.engine.start(PacketSource::Interface).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining");
    services.engine.stop().await;

    let status = services.engine.status();
    info!(
        packets_captured = status.packets_captured,
        flows_detected = status.flows_detected,
        flows_finalized = status.flows_finalized,
        packets_dropped = status.packets_dropped,
        "Final capture statistics"
    );

    Ok(())
}
