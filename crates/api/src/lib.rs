//! Control API: the JSON surface over the tunnel lifecycle engine.
//!
//! Routes, handlers and error mapping live here; the binary crate wires the
//! services in and serves the router. The static browser UI is an external
//! collaborator and is only mounted, never rendered.

mod error;
pub mod handlers;

pub use error::ApiError;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use monitor::DownloadMonitor;
use statestore::StateStore;
use tokens::TokenService;
use tunnels::TunnelManager;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub tokens: Arc<TokenService>,
    pub tunnels: Arc<TunnelManager>,
    pub monitor: Arc<DownloadMonitor>,
}

/// Build the router. `ui_dir` mounts the static admin UI as the fallback
/// when given.
pub fn build_router(state: AppState, ui_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/generate-link", post(handlers::generate_link))
        .route("/api/files", get(handlers::list_files))
        .route("/download/:token", get(handlers::download))
        .route("/admin/tunnels", get(handlers::admin_tunnels))
        .route("/admin/tunnels/:id", delete(handlers::admin_terminate))
        .route("/admin/tunnels/:id/stats", get(handlers::admin_tunnel_stats))
        .route("/admin/monitor/status", get(handlers::admin_monitor_status))
        .route("/admin/cleanup", post(handlers::admin_cleanup))
        .route("/admin/history", get(handlers::admin_history))
        .route("/health", get(handlers::health))
        .with_state(state);

    if let Some(dir) = ui_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the shutdown token fires, then drain in-flight
/// requests.
pub async fn serve(
    router: Router,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "control api listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
