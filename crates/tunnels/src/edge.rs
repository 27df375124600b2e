//! Edge provider seam.
//!
//! The edge provider is whatever turns a staged path into a publicly
//! reachable HTTPS hostname. Production drives a CLI (`EDGE_CMD`) the way a
//! cloudflared- or funnel-style binary is driven: spawn, bounded wait, parse
//! JSON from stdout. Tests use the in-memory provider.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use crate::{Result, TunnelError};

/// Backoff schedule for transient provider failures
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// One published route at the edge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeRoute {
    pub tunnel_id: String,
    /// Edge-assigned hostname, e.g. `a1b2c3d4.edge.example`
    pub hostname: String,
    /// Base URL of the route, e.g. `https://a1b2c3d4.edge.example`
    pub public_url: String,
}

#[async_trait]
pub trait EdgeProvider: Send + Sync {
    /// Expose the staged path publicly, returning the assigned route.
    async fn publish(&self, tunnel_id: &str, staged_path: &Path) -> Result<EdgeRoute>;

    /// Tear the route down. Unpublishing an unknown route is not an error.
    async fn unpublish(&self, tunnel_id: &str) -> Result<()>;

    /// Routes currently held at the edge, for reconciliation.
    async fn list_published(&self) -> Result<Vec<EdgeRoute>>;
}

/// Retry an edge call over the fixed backoff schedule.
pub(crate) async fn with_backoff<T, F, Fut>(what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for (attempt, delay) in std::iter::once(None)
        .chain(RETRY_DELAYS.iter().copied().map(Some))
        .enumerate()
    {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(op = what, attempt = attempt + 1, error = %err,
                    "edge call failed");
                last = Some(err);
            }
        }
    }
    Err(last.unwrap_or_else(|| TunnelError::EdgeProvision {
        reason: format!("{what}: no attempts ran"),
    }))
}

/// Drives an external edge CLI.
///
/// Expected subcommands:
/// - `publish --id <id> --path <staged>` printing `{"hostname", "public_url"}`
/// - `unpublish --id <id>`
/// - `list --json` printing an array of `{"tunnel_id", "hostname", "public_url"}`
pub struct CliEdgeProvider {
    command: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct PublishOutput {
    hostname: String,
    public_url: String,
}

impl CliEdgeProvider {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut command = Command::new(&self.command);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| TunnelError::EdgeProvision {
                reason: format!("{} {} timed out", self.command, args.join(" ")),
            })?
            .map_err(|err| TunnelError::EdgeProvision {
                reason: format!("failed to spawn {}: {err}", self.command),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::EdgeProvision {
                reason: format!(
                    "{} {} exited with {}: {}",
                    self.command,
                    args.join(" "),
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl EdgeProvider for CliEdgeProvider {
    async fn publish(&self, tunnel_id: &str, staged_path: &Path) -> Result<EdgeRoute> {
        let staged = staged_path.display().to_string();
        let stdout = self
            .run(&["publish", "--id", tunnel_id, "--path", &staged])
            .await?;
        let parsed: PublishOutput =
            serde_json::from_str(stdout.trim()).map_err(|err| TunnelError::EdgeProvision {
                reason: format!("unparseable publish output: {err}"),
            })?;
        Ok(EdgeRoute {
            tunnel_id: tunnel_id.to_string(),
            hostname: parsed.hostname,
            public_url: parsed.public_url,
        })
    }

    async fn unpublish(&self, tunnel_id: &str) -> Result<()> {
        self.run(&["unpublish", "--id", tunnel_id])
            .await
            .map_err(|err| TunnelError::EdgeUnpublish {
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn list_published(&self) -> Result<Vec<EdgeRoute>> {
        let stdout = self.run(&["list", "--json"]).await?;
        serde_json::from_str(stdout.trim()).map_err(|err| TunnelError::EdgeProvision {
            reason: format!("unparseable list output: {err}"),
        })
    }
}

/// In-process provider for tests and local development.
#[derive(Default)]
pub struct MemoryEdgeProvider {
    routes: Mutex<HashMap<String, EdgeRoute>>,
    fail_publish: AtomicBool,
    fail_unpublish: AtomicBool,
}

impl MemoryEdgeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publish calls fail until cleared.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent unpublish calls fail until cleared.
    pub fn set_fail_unpublish(&self, fail: bool) {
        self.fail_unpublish.store(fail, Ordering::SeqCst);
    }

    pub fn has_route(&self, tunnel_id: &str) -> bool {
        self.lock().contains_key(tunnel_id)
    }

    pub fn route_count(&self) -> usize {
        self.lock().len()
    }

    /// Plant a route with no backing record, as a crashed control plane
    /// would leave behind.
    pub fn inject_route(&self, tunnel_id: &str) {
        let route = Self::route_for(tunnel_id);
        self.lock().insert(tunnel_id.to_string(), route);
    }

    fn route_for(tunnel_id: &str) -> EdgeRoute {
        let hostname = format!("{tunnel_id}.edge.example");
        EdgeRoute {
            tunnel_id: tunnel_id.to_string(),
            public_url: format!("https://{hostname}"),
            hostname,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EdgeRoute>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EdgeProvider for MemoryEdgeProvider {
    async fn publish(&self, tunnel_id: &str, _staged_path: &Path) -> Result<EdgeRoute> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TunnelError::EdgeProvision {
                reason: "injected publish failure".into(),
            });
        }
        let route = Self::route_for(tunnel_id);
        self.lock().insert(tunnel_id.to_string(), route.clone());
        Ok(route)
    }

    async fn unpublish(&self, tunnel_id: &str) -> Result<()> {
        if self.fail_unpublish.load(Ordering::SeqCst) {
            return Err(TunnelError::EdgeUnpublish {
                reason: "injected unpublish failure".into(),
            });
        }
        self.lock().remove(tunnel_id);
        Ok(())
    }

    async fn list_published(&self) -> Result<Vec<EdgeRoute>> {
        Ok(self.lock().values().cloned().collect())
    }
}
