//! Typed environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Smallest acceptable HMAC secret, in bytes
const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid configuration for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Every knob the control plane recognizes, with its default.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub library_root: PathBuf,
    pub staging_root: PathBuf,
    pub state_store_url: String,
    pub jwt_secret: String,
    pub access_log_path: PathBuf,
    pub static_ui_dir: Option<PathBuf>,
    pub edge_cmd: String,
    pub edge_timeout: Duration,
    pub max_tunnel: Duration,
    pub stall_timeout: Duration,
    pub grace_period: Duration,
    pub history_retention: Duration,
    pub monitor_tick: Duration,
    pub checkpoint_every_events: usize,
    pub checkpoint_every: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret =
            std::env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::Invalid {
                key: "JWT_SECRET",
                reason: format!("must be at least {MIN_SECRET_BYTES} bytes"),
            });
        }

        Ok(Self {
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8000"),
            library_root: PathBuf::from(var_or("LIBRARY_ROOT", "/data")),
            staging_root: PathBuf::from(var_or("STAGING_ROOT", "/tunnels")),
            state_store_url: var_or("STATE_STORE_URL", "redis://127.0.0.1:6379"),
            jwt_secret,
            access_log_path: PathBuf::from(var_or(
                "ACCESS_LOG_PATH",
                "/var/log/static-server/access.log",
            )),
            static_ui_dir: std::env::var("STATIC_UI_DIR").ok().map(PathBuf::from),
            edge_cmd: var_or("EDGE_CMD", "edgectl"),
            edge_timeout: secs("EDGE_TIMEOUT_SECONDS", 30)?,
            max_tunnel: secs("MAX_TUNNEL_SECONDS", 3600)?,
            stall_timeout: secs("STALL_TIMEOUT_SECONDS", 300)?,
            grace_period: secs("GRACE_PERIOD_SECONDS", 3600)?,
            history_retention: secs("HISTORY_RETENTION_SECONDS", 86_400)?,
            monitor_tick: secs("MONITOR_TICK_SECONDS", 5)?,
            checkpoint_every_events: parsed("CHECKPOINT_EVERY_EVENTS", 50)?,
            checkpoint_every: secs("CHECKPOINT_EVERY_SECONDS", 5)?,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parsed(key, default)?))
}

fn parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
