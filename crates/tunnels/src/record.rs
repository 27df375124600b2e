//! Tunnel record types and the status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TUNNEL_KEY_PREFIX: &str = "tunnel:";
pub const HISTORY_KEY_PREFIX: &str = "history:";

/// Store key for a live tunnel record
pub fn tunnel_key(tunnel_id: &str) -> String {
    format!("{TUNNEL_KEY_PREFIX}{tunnel_id}")
}

/// Store key for a destroyed tunnel's history entry
pub fn history_key(tunnel_id: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{tunnel_id}")
}

/// Where a tunnel is in its life.
///
/// `completed` is special: the record stays live and the edge route stays
/// published until the grace deadline, after which the tunnel is destroyed
/// like any other. The remaining terminal statuses exist only while a
/// destroy is in flight; once it finishes the record moves to history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Provisioning,
    Active,
    Completed,
    Stalled,
    Expired,
    Terminated,
    Failed,
}

impl TunnelStatus {
    /// Statuses from which the only transition left is record deletion.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TunnelStatus::Stalled
                | TunnelStatus::Expired
                | TunnelStatus::Terminated
                | TunnelStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelStatus::Provisioning => "provisioning",
            TunnelStatus::Active => "active",
            TunnelStatus::Completed => "completed",
            TunnelStatus::Stalled => "stalled",
            TunnelStatus::Expired => "expired",
            TunnelStatus::Terminated => "terminated",
            TunnelStatus::Failed => "failed",
        }
    }
}

/// Why a tunnel is being destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Completed,
    Stalled,
    Expired,
    Terminated,
    Failed,
    Shutdown,
}

impl DestroyReason {
    /// The status a live record is moved to before teardown.
    pub fn terminal_status(self) -> TunnelStatus {
        match self {
            DestroyReason::Completed => TunnelStatus::Completed,
            DestroyReason::Stalled => TunnelStatus::Stalled,
            DestroyReason::Expired => TunnelStatus::Expired,
            DestroyReason::Terminated | DestroyReason::Shutdown => TunnelStatus::Terminated,
            DestroyReason::Failed => TunnelStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DestroyReason::Completed => "completed",
            DestroyReason::Stalled => "stalled",
            DestroyReason::Expired => "expired",
            DestroyReason::Terminated => "terminated",
            DestroyReason::Failed => "failed",
            DestroyReason::Shutdown => "shutdown",
        }
    }

    /// Reason to record when finishing teardown of a record found already in
    /// a terminal status (crash recovery).
    pub fn from_status(status: TunnelStatus) -> Self {
        match status {
            TunnelStatus::Completed => DestroyReason::Completed,
            TunnelStatus::Stalled => DestroyReason::Stalled,
            TunnelStatus::Expired => DestroyReason::Expired,
            TunnelStatus::Terminated => DestroyReason::Terminated,
            TunnelStatus::Provisioning | TunnelStatus::Active | TunnelStatus::Failed => {
                DestroyReason::Failed
            }
        }
    }
}

/// One live tunnel, as persisted in the state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelRecord {
    pub tunnel_id: String,
    /// Library-relative path, forward slashes
    pub file_path: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub bytes_served: u64,
    pub active_connections: u32,
    /// Log correlation IDs observed for this tunnel, bounded
    #[serde(default)]
    pub request_ids: Vec<String>,
}

impl TunnelRecord {
    /// Final path component of `file_path`, used in public URLs.
    pub fn basename(&self) -> &str {
        self.file_path.rsplit('/').next().unwrap_or(&self.file_path)
    }

    /// Bytes served, capped at the file size for reporting. Range-request
    /// overshoot can push the raw counter past the file size.
    pub fn reported_bytes(&self) -> u64 {
        self.bytes_served.min(self.file_size)
    }

    /// Download progress in percent, capped at 100.
    pub fn progress_percent(&self) -> f64 {
        if self.file_size == 0 {
            return if self.request_ids.is_empty() { 0.0 } else { 100.0 };
        }
        (self.reported_bytes() as f64 / self.file_size as f64 * 100.0).min(100.0)
    }
}

/// What remains of a tunnel after destruction, kept for a bounded retention
/// period for `/admin/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub tunnel_id: String,
    pub file_path: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: DateTime<Utc>,
    pub bytes_served: u64,
}

impl HistoryRecord {
    pub fn from_record(record: &TunnelRecord, reason: DestroyReason, now: DateTime<Utc>) -> Self {
        Self {
            tunnel_id: record.tunnel_id.clone(),
            file_path: record.file_path.clone(),
            file_size: record.file_size,
            hostname: record.hostname.clone(),
            reason: reason.as_str().to_string(),
            created_at: record.created_at,
            destroyed_at: now,
            bytes_served: record.reported_bytes(),
        }
    }
}
