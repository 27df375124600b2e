//! Download monitor.
//!
//! Tails the static server's access log, attributes byte counts to tunnels,
//! and drives the destruction triggers: completion, stall, expiry, and the
//! post-completion grace period. The monitor only reads tunnel records and
//! calls the manager's idempotent destroy, so it needs no locks beyond the
//! store's compare-and-swap.

mod monitor;
mod parser;
mod tail;

pub use monitor::{DownloadMonitor, MonitorConfig, MonitorStatus, TickReport};
pub use parser::{parse_line, AccessLogEvent, RouteKind};
pub use tail::LogTailer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Store(#[from] statestore::StoreError),

    #[error(transparent)]
    Tunnel(#[from] tunnels::TunnelError),

    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
