//! Tunnel lifecycle management.
//!
//! A tunnel maps an 8-hex-char ID to one staged file and one published edge
//! route. This crate owns the tunnel record state machine: allocation,
//! staging, publishing, destruction, and the startup reconciliation that
//! repairs any disagreement between the store, the staging directory, and
//! the edge provider after a crash.

mod edge;
mod error;
mod manager;
mod record;
mod staging;

pub use edge::{CliEdgeProvider, EdgeProvider, EdgeRoute, MemoryEdgeProvider};
pub use error::TunnelError;
pub use manager::{ReconcileReport, TunnelManager};
pub use record::{
    history_key, tunnel_key, DestroyReason, HistoryRecord, TunnelRecord, TunnelStatus,
    HISTORY_KEY_PREFIX, TUNNEL_KEY_PREFIX,
};
pub use staging::{resolve_library_file, ResolvedFile};

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
