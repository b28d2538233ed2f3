//! Hedge coordination client process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hedge_core::config::Config;
use hedge_node::Runtime;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hedge-node")]
#[command(about = "Position lifecycle and action coordination for hedged accounts", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file; environment variables are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the client identity
    #[arg(long)]
    client_id: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    /// Seconds between health log lines
    #[arg(long, default_value_t = 60)]
    health_interval: u64,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "hedge_node=info,trading_engine=info,risk_manager=info,hedge_core=warn".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(client_id) = cli.client_id {
        config.client_id = client_id;
    }

    info!(
        client_id = %config.client_id,
        accounts = ?config.owned_accounts,
        "Starting hedge node"
    );

    let mut runtime = Runtime::build(config)?;
    runtime.start()?;

    let mut health = tokio::time::interval(Duration::from_secs(cli.health_interval.max(1)));
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = health.tick() => {
                let report = runtime.health();
                if report.healthy {
                    info!(
                        open_positions = report.open_positions,
                        executed = report.sync.executed,
                        failed = report.sync.failed,
                        trails = report.trail.monitored,
                        "Health check"
                    );
                } else {
                    warn!(report = %serde_json::to_string(&report)?, "Health check failed");
                }
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
