mod listener;
mod session;

use facestream_common::config::Config;
use listener::{ListenerSettings, REACCEPT_DELAY};
use session::SessionSettings;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let addr = config.endpoint.addr();
    info!(
        endpoint = addr,
        print_interval_ms = config.receiver.print_interval_ms,
        snapshot_path = config.receiver.snapshot_path.as_deref().unwrap_or("-"),
        "starting facestream receiver"
    );

    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(endpoint = addr, error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            // Dropping the sender would read as a shutdown request.
            std::future::pending::<()>().await;
        }
        info!("quit requested");
        let _ = shutdown_tx.send(true);
    });

    let settings = ListenerSettings {
        session: SessionSettings {
            print_interval: Duration::from_millis(config.receiver.print_interval_ms),
            snapshot_path: config.receiver.snapshot_path.map(PathBuf::from),
        },
        reaccept_delay: REACCEPT_DELAY,
    };
    info!(endpoint = addr, "waiting for producer");
    listener::serve(listener, settings, shutdown_rx).await;
}
