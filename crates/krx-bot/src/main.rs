//! KRX slot trader - Entry Point
//!
//! Runs against the paper broker. Sessions are loaded from the configured
//! JSON store and mirrored into the paper account before monitoring starts.

use anyhow::Result;
use clap::Parser;
use krx_core::Holding;
use krx_executor::PaperBroker;
use krx_persistence::{JsonFileSessionStore, SessionStore};
use krx_position::KstClock;
use krx_telemetry::TracingNotifier;
use krx_ws::StaticApprovalKey;
use std::sync::Arc;
use tracing::info;

/// KRX slot trader
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via KRX_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = krx_bot::AppConfig::resolve_path(args.config);
    let config = krx_bot::AppConfig::from_file(&config_path)?;

    krx_telemetry::init_logging(&config.telemetry.log_filter)?;
    info!("Starting KRX slot trader v{}", env!("CARGO_PKG_VERSION"));
    info!(config_path = %config_path.display(), "Configuration loaded");

    let approval_key = config.approval_key()?;
    let store = Arc::new(JsonFileSessionStore::open(
        config.persistence.sessions_path.clone(),
    )?);

    let paper = Arc::new(PaperBroker::new(config.paper.clone()));
    for session in store.list_all().await? {
        if session.quantity > 0 {
            paper.seed_holding(Holding {
                ticker: session.ticker.clone(),
                quantity: session.quantity,
                avg_price: session.avg_price,
            });
        }
    }

    let services = krx_bot::Services {
        broker: paper,
        store,
        approval_keys: Arc::new(StaticApprovalKey::new(approval_key)),
        notifier: Arc::new(TracingNotifier),
        clock: Arc::new(KstClock),
    };

    let app = krx_bot::Application::new(config, services)?;
    let summary = app.run().await?;
    info!(
        started = summary.started,
        reports = summary.reports.len(),
        crashed = summary.crashed,
        "Shutdown complete"
    );

    Ok(())
}
