//! dropgate: short-lived, single-use public download tunnels for a private
//! file library.

mod config;

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api::AppState;
use config::Config;
use monitor::{DownloadMonitor, LogTailer, MonitorConfig};
use statestore::StateStore;
use tokens::TokenService;
use tunnels::{CliEdgeProvider, DestroyReason, EdgeProvider, TunnelManager};

/// How long in-flight requests get to finish after the shutdown signal
const DRAIN_GRACE: Duration = Duration::from_secs(10);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() {
    dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,dropgate=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let store = statestore::connect(&config.state_store_url)?;
    store.ping().await?;
    info!(url = %config.state_store_url, "connected to state store");

    let edge: Arc<dyn EdgeProvider> = Arc::new(CliEdgeProvider::new(
        config.edge_cmd.clone(),
        config.edge_timeout,
    ));
    let manager = Arc::new(TunnelManager::new(
        store.clone(),
        edge,
        config.library_root.clone(),
        config.staging_root.clone(),
        config.max_tunnel,
        config.history_retention,
    ));
    let token_service = Arc::new(TokenService::new(
        store.clone(),
        &config.jwt_secret,
        config.max_tunnel,
    ));

    match manager.reconcile_on_startup().await {
        Ok(report) => info!(resumed = report.resumed, cleaned = report.cleaned,
            orphan_routes = report.orphan_routes, "reconciled state on startup"),
        Err(err) => warn!(error = %err, "startup reconciliation failed, continuing"),
    }

    let tailer = LogTailer::start(
        config.access_log_path.clone(),
        store.clone(),
        true,
        config.checkpoint_every_events,
        config.checkpoint_every,
    )
    .await?;
    let download_monitor = Arc::new(DownloadMonitor::new(
        store.clone(),
        manager.clone(),
        tailer,
        MonitorConfig {
            stall_timeout: config.stall_timeout,
            grace_period: config.grace_period,
            tick_interval: config.monitor_tick,
            ..MonitorConfig::default()
        },
    ));

    let shutdown = CancellationToken::new();

    let monitor_task = tokio::spawn(download_monitor.clone().run(shutdown.clone()));

    let sweeper_task = {
        let tokens = token_service.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = tokens.sweep().await {
                            warn!(error = %err, "token sweep failed");
                        }
                    }
                }
            }
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let state = AppState {
        store: store.clone(),
        tokens: token_service,
        tunnels: manager.clone(),
        monitor: download_monitor,
    };
    let router = api::build_router(state, config.static_ui_dir.clone());

    let server = api::serve(router, &config.bind_addr, shutdown.clone());
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => result?,
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(DRAIN_GRACE).await;
        } => {
            warn!("drain grace elapsed, abandoning in-flight requests");
        }
    }

    let _ = monitor_task.await;
    let _ = sweeper_task.await;

    // nothing may stay publicly reachable past our lifetime
    match manager.list_live().await {
        Ok(records) => {
            for record in records {
                if let Err(err) = manager
                    .destroy_tunnel(&record.tunnel_id, DestroyReason::Shutdown)
                    .await
                {
                    error!(tunnel_id = %record.tunnel_id, error = %err,
                        "failed to destroy tunnel during shutdown");
                }
            }
        }
        Err(err) => error!(error = %err, "could not list tunnels during shutdown"),
    }

    info!("shutdown complete");
    Ok(())
}
