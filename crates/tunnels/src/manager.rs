//! Tunnel manager: allocation, provisioning, destruction, reconciliation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use statestore::StateStore;

use crate::edge::{with_backoff, EdgeProvider};
use crate::record::{
    history_key, tunnel_key, DestroyReason, HistoryRecord, TunnelRecord, TunnelStatus,
    HISTORY_KEY_PREFIX, TUNNEL_KEY_PREFIX,
};
use crate::staging;
use crate::{Result, TunnelError};

/// Collision retries for the 8-hex-char ID space
const ID_ATTEMPTS: usize = 8;

pub struct TunnelManager {
    store: Arc<dyn StateStore>,
    edge: Arc<dyn EdgeProvider>,
    library_root: PathBuf,
    staging_root: PathBuf,
    max_tunnel: Duration,
    history_retention: Duration,
}

/// Outcome of startup reconciliation
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    /// Live tunnels that survived the restart
    pub resumed: usize,
    /// Records cleaned up (lost routes, interrupted provisioning/destroys)
    pub cleaned: usize,
    /// Edge routes with no backing record, unpublished
    pub orphan_routes: usize,
}

impl TunnelManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        edge: Arc<dyn EdgeProvider>,
        library_root: PathBuf,
        staging_root: PathBuf,
        max_tunnel: Duration,
        history_retention: Duration,
    ) -> Self {
        Self {
            store,
            edge,
            library_root,
            staging_root,
            max_tunnel,
            history_retention,
        }
    }

    pub fn max_tunnel_seconds(&self) -> u64 {
        self.max_tunnel.as_secs()
    }

    pub fn library_root(&self) -> &PathBuf {
        &self.library_root
    }

    /// Create a tunnel for `file_path` with the requested lifetime.
    ///
    /// Lifetimes above `MAX_TUNNEL_SECONDS` are clamped. On any failure after
    /// the record reservation the half-built tunnel is destroyed before the
    /// error is returned, so no staging reference or edge route outlives the
    /// call.
    pub async fn create_tunnel(&self, file_path: &str, ttl: Duration) -> Result<TunnelRecord> {
        let ttl = ttl.min(self.max_tunnel);
        let resolved = staging::resolve_library_file(&self.library_root, file_path)?;

        let now = Utc::now();
        let mut record = TunnelRecord {
            tunnel_id: String::new(),
            file_path: resolved.relative.clone(),
            file_size: resolved.size,
            public_url: None,
            download_url: None,
            hostname: None,
            status: TunnelStatus::Provisioning,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
            grace_deadline: None,
            last_activity_at: None,
            bytes_served: 0,
            active_connections: 0,
            request_ids: Vec::new(),
        };

        // set-if-absent on the record key is what makes IDs unique under
        // concurrent creation
        let mut reserved = false;
        for _ in 0..ID_ATTEMPTS {
            record.tunnel_id = new_tunnel_id();
            let json = encode(&record)?;
            if self
                .store
                .set_if_absent(&tunnel_key(&record.tunnel_id), &json, None)
                .await?
            {
                reserved = true;
                break;
            }
        }
        if !reserved {
            return Err(TunnelError::IdAllocation {
                attempts: ID_ATTEMPTS,
            });
        }
        let tunnel_id = record.tunnel_id.clone();
        tracing::info!(tunnel_id = %tunnel_id, file = %record.file_path,
            size = record.file_size, ttl_seconds = ttl.as_secs(), "provisioning tunnel");

        let staged = match staging::stage(&self.staging_root, &tunnel_id, &resolved.absolute) {
            Ok(link) => link,
            Err(err) => {
                self.abandon(&tunnel_id).await;
                return Err(err);
            }
        };

        let route = match with_backoff("publish", || self.edge.publish(&tunnel_id, &staged)).await
        {
            Ok(route) => route,
            Err(err) => {
                self.abandon(&tunnel_id).await;
                return Err(err);
            }
        };

        let base = route.public_url.trim_end_matches('/');
        record.public_url = Some(format!("{base}/files/{tunnel_id}/{}", record.basename()));
        record.download_url = Some(format!(
            "{base}/download-file/{tunnel_id}/{}",
            record.basename()
        ));
        record.hostname = Some(route.hostname);
        record.status = TunnelStatus::Active;

        let json = encode(&record)?;
        if let Err(err) = self.store.set(&tunnel_key(&tunnel_id), &json, None).await {
            self.abandon(&tunnel_id).await;
            return Err(err.into());
        }

        tracing::info!(tunnel_id = %tunnel_id,
            url = record.public_url.as_deref().unwrap_or(""), "tunnel active");
        Ok(record)
    }

    /// Tear a tunnel down: terminal status, route unpublished, staging
    /// removed, history written, live record deleted.
    ///
    /// Idempotent: a repeat call finds no record and returns `false`. A
    /// record already in a terminal status (a destroy interrupted by a
    /// crash) has its teardown finished rather than skipped.
    pub async fn destroy_tunnel(&self, tunnel_id: &str, reason: DestroyReason) -> Result<bool> {
        let key = tunnel_key(tunnel_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let mut record: TunnelRecord =
            serde_json::from_str(&raw).map_err(|_| TunnelError::CorruptRecord { key: key.clone() })?;

        let reason = if record.status.is_terminal() {
            DestroyReason::from_status(record.status)
        } else {
            let mut updated = record.clone();
            updated.status = reason.terminal_status();
            let json = encode(&updated)?;
            if self.store.compare_and_swap(&key, &raw, &json).await? {
                record = updated;
            } else if let Some(current) = self.load(tunnel_id).await? {
                // lost the race; finish teardown of whatever state won
                record = current;
            } else {
                return Ok(false);
            }
            reason
        };

        tracing::info!(tunnel_id = %tunnel_id, reason = reason.as_str(),
            bytes_served = record.reported_bytes(), "destroying tunnel");

        if let Err(err) = with_backoff("unpublish", || self.edge.unpublish(tunnel_id)).await {
            // the reconciler sweeps leftover routes on the next startup
            tracing::error!(tunnel_id = %tunnel_id, error = %err,
                "failed to unpublish edge route");
        }

        if let Err(err) = staging::unstage(&self.staging_root, tunnel_id) {
            tracing::warn!(tunnel_id = %tunnel_id, error = %err,
                "failed to remove staging reference");
        }

        let history = HistoryRecord::from_record(&record, reason, Utc::now());
        let history_json =
            serde_json::to_string(&history).map_err(|_| TunnelError::CorruptRecord {
                key: history_key(tunnel_id),
            })?;
        self.store
            .set(
                &history_key(tunnel_id),
                &history_json,
                Some(self.history_retention),
            )
            .await?;
        self.store.delete(&key).await?;
        Ok(true)
    }

    /// Mark a tunnel terminated by an operator and destroy it.
    pub async fn terminate(&self, tunnel_id: &str) -> Result<()> {
        if !self.destroy_tunnel(tunnel_id, DestroyReason::Terminated).await? {
            return Err(TunnelError::NotFound {
                tunnel_id: tunnel_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn load(&self, tunnel_id: &str) -> Result<Option<TunnelRecord>> {
        Ok(self.load_raw(tunnel_id).await?.map(|(_, record)| record))
    }

    /// Record plus the exact bytes it was read as, for compare-and-swap
    /// updates by the monitor.
    pub async fn load_raw(&self, tunnel_id: &str) -> Result<Option<(String, TunnelRecord)>> {
        let key = tunnel_key(tunnel_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let record =
            serde_json::from_str(&raw).map_err(|_| TunnelError::CorruptRecord { key })?;
        Ok(Some((raw, record)))
    }

    /// Swap a record against its previously read bytes. `false` means another
    /// writer got there first and the caller should re-read.
    pub async fn swap(
        &self,
        tunnel_id: &str,
        read_as: &str,
        updated: &TunnelRecord,
    ) -> Result<bool> {
        let json = encode(updated)?;
        Ok(self
            .store
            .compare_and_swap(&tunnel_key(tunnel_id), read_as, &json)
            .await?)
    }

    /// All live records: provisioning, active, and completed-in-grace.
    pub async fn list_live(&self) -> Result<Vec<TunnelRecord>> {
        let mut records = Vec::new();
        for key in self.store.keys_with_prefix(TUNNEL_KEY_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<TunnelRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping corrupt tunnel record")
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Destroyed tunnels still inside the retention window, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut entries = Vec::new();
        for key in self.store.keys_with_prefix(HISTORY_KEY_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            if let Ok(entry) = serde_json::from_str::<HistoryRecord>(&raw) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| b.destroyed_at.cmp(&a.destroyed_at));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Restore consistency between store, staging directory and edge after a
    /// restart.
    ///
    /// - records in a terminal status had their destroy interrupted: finish it
    /// - provisioning records never went active: destroy as failed
    /// - live records whose route vanished while we were down: destroy as failed
    /// - routes with no backing record: unpublish
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        let routes = self.edge.list_published().await?;
        let published: HashSet<&str> = routes.iter().map(|r| r.tunnel_id.as_str()).collect();
        let mut report = ReconcileReport::default();

        let mut known = HashSet::new();
        for key in self.store.keys_with_prefix(TUNNEL_KEY_PREFIX).await? {
            let tunnel_id = key.trim_start_matches(TUNNEL_KEY_PREFIX).to_string();
            known.insert(tunnel_id.clone());
            let Some(record) = self.load(&tunnel_id).await.ok().flatten() else {
                continue;
            };

            if record.status.is_terminal() {
                tracing::warn!(tunnel_id = %tunnel_id, status = record.status.as_str(),
                    "finishing interrupted destroy");
                self.destroy_tunnel(&tunnel_id, DestroyReason::from_status(record.status))
                    .await?;
                report.cleaned += 1;
            } else if record.status == TunnelStatus::Provisioning {
                tracing::warn!(tunnel_id = %tunnel_id, "cleaning interrupted provisioning");
                self.destroy_tunnel(&tunnel_id, DestroyReason::Failed).await?;
                report.cleaned += 1;
            } else if !published.contains(tunnel_id.as_str()) {
                tracing::warn!(tunnel_id = %tunnel_id, "edge route lost while down");
                self.destroy_tunnel(&tunnel_id, DestroyReason::Failed).await?;
                report.cleaned += 1;
            } else {
                report.resumed += 1;
            }
        }

        for route in &routes {
            if !known.contains(&route.tunnel_id) {
                tracing::warn!(tunnel_id = %route.tunnel_id, hostname = %route.hostname,
                    "unpublishing orphan edge route");
                if let Err(err) = self.edge.unpublish(&route.tunnel_id).await {
                    tracing::error!(tunnel_id = %route.tunnel_id, error = %err,
                        "failed to unpublish orphan route");
                }
                let _ = staging::unstage(&self.staging_root, &route.tunnel_id);
                report.orphan_routes += 1;
            }
        }

        tracing::info!(resumed = report.resumed, cleaned = report.cleaned,
            orphan_routes = report.orphan_routes, "startup reconciliation finished");
        Ok(report)
    }

    /// Best-effort teardown of a half-provisioned tunnel; the creation error
    /// is what the caller reports.
    async fn abandon(&self, tunnel_id: &str) {
        if let Err(err) = self.destroy_tunnel(tunnel_id, DestroyReason::Failed).await {
            tracing::error!(tunnel_id = %tunnel_id, error = %err,
                "failed to clean up after provisioning error");
        }
    }
}

fn new_tunnel_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

fn encode(record: &TunnelRecord) -> Result<String> {
    serde_json::to_string(record).map_err(|_| TunnelError::CorruptRecord {
        key: tunnel_key(&record.tunnel_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::MemoryEdgeProvider;
    use statestore::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        manager: TunnelManager,
        store: Arc<MemoryStore>,
        edge: Arc<MemoryEdgeProvider>,
        _library: TempDir,
        staging: TempDir,
    }

    fn fixture() -> Fixture {
        let library = TempDir::new().unwrap();
        std::fs::write(library.path().join("a.txt"), b"hello world!").unwrap();
        std::fs::write(library.path().join("empty.bin"), b"").unwrap();
        let staging = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let edge = Arc::new(MemoryEdgeProvider::new());
        let manager = TunnelManager::new(
            store.clone(),
            edge.clone(),
            library.path().to_path_buf(),
            staging.path().to_path_buf(),
            Duration::from_secs(3600),
            Duration::from_secs(600),
        );
        Fixture {
            manager,
            store,
            edge,
            _library: library,
            staging,
        }
    }

    #[test]
    fn tunnel_ids_are_short_hex() {
        let id = new_tunnel_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[tokio::test]
    async fn create_stages_publishes_and_activates() {
        let fx = fixture();
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(record.status, TunnelStatus::Active);
        assert_eq!(record.file_size, 12);
        assert_eq!(record.tunnel_id.len(), 8);
        let host = format!("{}.edge.example", record.tunnel_id);
        assert_eq!(record.hostname.as_deref(), Some(host.as_str()));
        assert_eq!(
            record.public_url.as_deref().unwrap(),
            format!("https://{host}/files/{}/a.txt", record.tunnel_id)
        );
        assert_eq!(
            record.download_url.as_deref().unwrap(),
            format!("https://{host}/download-file/{}/a.txt", record.tunnel_id)
        );

        // expiry bounded by creation time
        assert!(record.created_at <= record.expires_at);
        assert_eq!((record.expires_at - record.created_at).num_seconds(), 300);

        // staging reference exists and reads through to the library file
        let link = fx.staging.path().join(&record.tunnel_id).join("file");
        assert_eq!(std::fs::read(&link).unwrap(), b"hello world!");
        assert!(fx.edge.has_route(&record.tunnel_id));
    }

    #[tokio::test]
    async fn create_then_list_then_get_round_trips() {
        let fx = fixture();
        let created = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap();

        let listed = fx.manager.list_live().await.unwrap();
        assert_eq!(listed, vec![created.clone()]);

        let loaded = fx.manager.load(&created.tunnel_id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn ttl_is_clamped_to_max() {
        let fx = fixture();
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!((record.expires_at - record.created_at).num_seconds(), 3600);
    }

    #[tokio::test]
    async fn traversal_creates_nothing() {
        let fx = fixture();
        let err = fx
            .manager
            .create_tunnel("../etc/passwd", Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::PathEscape { .. } | TunnelError::FileNotFound { .. }
        ));
        assert!(fx.store.keys_with_prefix("tunnel:").await.unwrap().is_empty());
        assert_eq!(fx.edge.route_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_rolls_back() {
        let fx = fixture();
        fx.edge.set_fail_publish(true);
        let err = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::EdgeProvision { .. }));

        // no live record, no staging leftovers, a failed history entry
        assert!(fx.store.keys_with_prefix("tunnel:").await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(fx.staging.path()).unwrap().count(), 0);
        let history = fx.manager.history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "failed");
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let fx = fixture();
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        assert!(fx
            .manager
            .destroy_tunnel(&id, DestroyReason::Terminated)
            .await
            .unwrap());
        assert!(!fx
            .manager
            .destroy_tunnel(&id, DestroyReason::Terminated)
            .await
            .unwrap());

        assert!(!fx.edge.has_route(&id));
        assert!(!fx.staging.path().join(&id).exists());
        assert!(fx.manager.load(&id).await.unwrap().is_none());

        let history = fx.manager.history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "terminated");
        assert_eq!(history[0].tunnel_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_survives_unpublish_failure() {
        let fx = fixture();
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap();
        fx.edge.set_fail_unpublish(true);

        assert!(fx
            .manager
            .destroy_tunnel(&record.tunnel_id, DestroyReason::Expired)
            .await
            .unwrap());
        // record is gone even though the route leaked; the reconciler owns it now
        assert!(fx.manager.load(&record.tunnel_id).await.unwrap().is_none());
        assert!(fx.edge.has_route(&record.tunnel_id));
    }

    #[tokio::test]
    async fn terminate_unknown_tunnel_is_not_found() {
        let fx = fixture();
        let err = fx.manager.terminate("00000000").await.unwrap_err();
        assert!(matches!(err, TunnelError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reconcile_cleans_lost_routes_and_orphans() {
        let fx = fixture();
        let kept = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap();
        let lost = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap();

        // the edge dropped one route while we were down
        fx.edge.unpublish(&lost.tunnel_id).await.unwrap();
        // and some other crashed instance left an orphan route behind
        fx.edge.inject_route("0badc0de");

        let report = fx.manager.reconcile_on_startup().await.unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(report.cleaned, 1);
        assert_eq!(report.orphan_routes, 1);

        assert!(fx.manager.load(&kept.tunnel_id).await.unwrap().is_some());
        assert!(fx.manager.load(&lost.tunnel_id).await.unwrap().is_none());
        assert!(!fx.edge.has_route("0badc0de"));
    }

    #[tokio::test]
    async fn reconcile_finishes_interrupted_destroy() {
        let fx = fixture();
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(300))
            .await
            .unwrap();

        // simulate a crash right after the terminal-status CAS
        let (raw, mut stuck) = fx
            .manager
            .load_raw(&record.tunnel_id)
            .await
            .unwrap()
            .unwrap();
        stuck.status = TunnelStatus::Expired;
        assert!(fx.manager.swap(&record.tunnel_id, &raw, &stuck).await.unwrap());

        let report = fx.manager.reconcile_on_startup().await.unwrap();
        assert_eq!(report.cleaned, 1);
        assert!(fx.manager.load(&record.tunnel_id).await.unwrap().is_none());
        assert!(!fx.edge.has_route(&record.tunnel_id));
        let history = fx.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, "expired");
    }
}
