//! Request handlers for the control API.

use std::path::Path as FsPath;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use statestore::StateStore;
use tunnels::{HistoryRecord, TunnelRecord};

use crate::error::{ApiError, Result};
use crate::AppState;

const HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GenerateLinkRequest {
    pub file_path: String,
    #[serde(default = "default_expiry")]
    pub expires_in_seconds: i64,
}

fn default_expiry() -> i64 {
    3600
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateLinkResponse {
    pub download_url: String,
    pub tunnel_id: String,
    pub token: String,
    pub file_path: String,
    /// Effective lifetime after clamping
    pub expires_in_seconds: i64,
}

/// Admin-facing view of a tunnel record. Byte counts are capped at the file
/// size here; the raw counter can overshoot on range requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct TunnelView {
    pub tunnel_id: String,
    pub file_path: String,
    pub file_size: u64,
    pub public_url: Option<String>,
    pub download_url: Option<String>,
    pub hostname: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub grace_deadline: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub bytes_served: u64,
    pub active_connections: u32,
    pub progress_percent: f64,
}

impl From<&TunnelRecord> for TunnelView {
    fn from(record: &TunnelRecord) -> Self {
        Self {
            tunnel_id: record.tunnel_id.clone(),
            file_path: record.file_path.clone(),
            file_size: record.file_size,
            public_url: record.public_url.clone(),
            download_url: record.download_url.clone(),
            hostname: record.hostname.clone(),
            status: record.status.as_str().to_string(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            grace_deadline: record.grace_deadline,
            last_activity_at: record.last_activity_at,
            bytes_served: record.reported_bytes(),
            active_connections: record.active_connections,
            progress_percent: record.progress_percent(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveTunnels {
    pub active_tunnels: Vec<TunnelView>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct TunnelStats {
    pub tunnel: TunnelView,
    pub download_progress: DownloadProgress,
}

#[derive(Debug, Serialize)]
pub struct DownloadProgress {
    pub bytes_served: u64,
    pub file_size: u64,
    pub percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct MonitorStatusResponse {
    pub monitor_active: bool,
    pub active_tunnels_count: usize,
    pub active_downloads: usize,
    pub state_store_connected: bool,
    pub state_store_memory: Option<String>,
    pub uptime_seconds: u64,
    pub malformed_lines: u64,
    pub stall_timeout_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub message: &'static str,
    pub cleaned_tunnels: usize,
    pub swept_tokens: u64,
    pub events_processed: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub tunnel_history: Vec<HistoryRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub public_url: String,
    pub tunnel_id: String,
    pub file_path: String,
    pub message: &'static str,
}

// ---------------------------------------------------------------------------
// Link generation and the public download path
// ---------------------------------------------------------------------------

/// `POST /generate-link` — create the tunnel up front and mint its token.
///
/// `expires_in_seconds` must be positive; values above the configured
/// maximum are clamped, and the clamped value is echoed back.
pub async fn generate_link(
    State(state): State<AppState>,
    Json(request): Json<GenerateLinkRequest>,
) -> Result<Json<GenerateLinkResponse>> {
    if request.expires_in_seconds <= 0 {
        return Err(ApiError::BadRequest(
            "expires_in_seconds must be positive".into(),
        ));
    }
    let ttl = Duration::from_secs(request.expires_in_seconds as u64);

    let record = state.tunnels.create_tunnel(&request.file_path, ttl).await?;
    let effective = (record.expires_at - record.created_at).num_seconds();

    let minted = match state
        .tokens
        .mint(&record.file_path, ttl, &record.tunnel_id)
        .await
    {
        Ok(minted) => minted,
        Err(err) => {
            // a tunnel without a token is unreachable by design; tear it down
            let _ = state
                .tunnels
                .destroy_tunnel(&record.tunnel_id, tunnels::DestroyReason::Failed)
                .await;
            return Err(err.into());
        }
    };

    let download_url = record
        .download_url
        .clone()
        .ok_or_else(|| ApiError::Internal("tunnel missing download url".into()))?;

    Ok(Json(GenerateLinkResponse {
        download_url,
        tunnel_id: record.tunnel_id,
        token: minted.token,
        file_path: record.file_path,
        expires_in_seconds: effective,
    }))
}

/// `GET|HEAD /download/:token` — the public token-redemption endpoint.
///
/// GET consumes the token and answers with the edge URL. HEAD checks the
/// token without consuming it, so link previews do not burn the single use.
/// Every invalid-token outcome is an empty 444.
pub async fn download(
    State(state): State<AppState>,
    method: Method,
    Path(token): Path<String>,
) -> Result<Response> {
    if method == Method::HEAD {
        let claims = state.tokens.peek(&token).map_err(ApiError::from)?;
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&claims.file_path) {
            headers.insert("x-file-path", value);
        }
        headers.insert("x-token-valid", HeaderValue::from_static("true"));
        return Ok((StatusCode::OK, headers).into_response());
    }

    let consumed = state.tokens.validate_and_consume(&token).await?;
    let record = state
        .tunnels
        .load(&consumed.tunnel_id)
        .await?
        .ok_or(ApiError::TokenRejected)?;
    let public_url = record.download_url.ok_or(ApiError::TokenRejected)?;

    Ok(Json(DownloadResponse {
        public_url,
        tunnel_id: consumed.tunnel_id,
        file_path: consumed.file_path,
        message: "Tunnel ready. The download link is single-use and expires.",
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Library listing
// ---------------------------------------------------------------------------

/// `GET /api/files` — relative paths of every shareable file, sorted.
pub async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    let root = state.tunnels.library_root().clone();
    let files = tokio::task::spawn_blocking(move || collect_files(&root))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(|err| ApiError::Internal(format!("failed to list library: {err}")))?;
    Ok(Json(files))
}

fn collect_files(root: &FsPath) -> std::io::Result<Vec<String>> {
    fn walk(dir: &FsPath, prefix: &str, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let relative = if prefix.is_empty() {
                name.into_owned()
            } else {
                format!("{prefix}/{name}")
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(&entry.path(), &relative, out)?;
            } else if file_type.is_file() {
                out.push(relative);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, "", &mut files)?;
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

/// `GET /admin/tunnels`
pub async fn admin_tunnels(State(state): State<AppState>) -> Result<Json<ActiveTunnels>> {
    let records = state.tunnels.list_live().await?;
    let views: Vec<TunnelView> = records.iter().map(TunnelView::from).collect();
    Ok(Json(ActiveTunnels {
        count: views.len(),
        active_tunnels: views,
    }))
}

/// `GET /admin/tunnels/:id/stats`
pub async fn admin_tunnel_stats(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<TunnelStats>> {
    let record = state
        .tunnels
        .load(&tunnel_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("tunnel {tunnel_id} not found")))?;
    Ok(Json(TunnelStats {
        download_progress: DownloadProgress {
            bytes_served: record.reported_bytes(),
            file_size: record.file_size,
            percentage: record.progress_percent(),
        },
        tunnel: TunnelView::from(&record),
    }))
}

/// `DELETE /admin/tunnels/:id`
pub async fn admin_terminate(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.tunnels.terminate(&tunnel_id).await?;
    Ok(Json(serde_json::json!({
        "message": format!("tunnel {tunnel_id} terminated"),
        "tunnel_id": tunnel_id,
    })))
}

/// `GET /admin/monitor/status`
pub async fn admin_monitor_status(
    State(state): State<AppState>,
) -> Result<Json<MonitorStatusResponse>> {
    let status = state.monitor.status().await;
    Ok(Json(MonitorStatusResponse {
        monitor_active: status.monitor_active,
        active_tunnels_count: status.active_tunnels_count,
        active_downloads: status.active_downloads,
        state_store_connected: status.state_store_connected,
        state_store_memory: status.state_store_memory,
        uptime_seconds: status.uptime_seconds,
        malformed_lines: status.malformed_lines,
        stall_timeout_seconds: status.stall_timeout_seconds,
    }))
}

/// `POST /admin/cleanup` — run a monitor tick and a token sweep right now.
pub async fn admin_cleanup(State(state): State<AppState>) -> Result<Json<CleanupResponse>> {
    let report = state.monitor.tick().await?;
    let swept = state.tokens.sweep().await?;
    Ok(Json(CleanupResponse {
        message: "cleanup completed",
        cleaned_tunnels: report.destroyed,
        swept_tokens: swept,
        events_processed: report.events,
    }))
}

/// `GET /admin/history`
pub async fn admin_history(State(state): State<AppState>) -> Result<Json<HistoryResponse>> {
    let entries = state.tunnels.history(HISTORY_LIMIT).await?;
    Ok(Json(HistoryResponse {
        count: entries.len(),
        tunnel_history: entries,
    }))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    state.store.ping().await?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "state_store": "connected",
    })))
}
