//! Trigger evaluation and byte attribution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use statestore::StateStore;
use tunnels::{DestroyReason, TunnelManager, TunnelStatus};

use crate::parser::{parse_line, AccessLogEvent, RouteKind};
use crate::tail::LogTailer;
use crate::Result;

/// Retries for read-modify-CAS record updates before giving up on an event
const UPDATE_ATTEMPTS: usize = 3;

/// Cap on correlation IDs kept per record
const MAX_REQUEST_IDS: usize = 64;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub stall_timeout: Duration,
    pub grace_period: Duration,
    pub tick_interval: Duration,
    /// Window for the distinct-request-id connection heuristic
    pub connection_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(3600),
            tick_interval: Duration::from_secs(5),
            connection_window: Duration::from_secs(30),
        }
    }
}

/// What one tick did
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub events: usize,
    pub malformed: usize,
    pub destroyed: usize,
}

/// Snapshot for `/admin/monitor/status`
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub monitor_active: bool,
    pub active_tunnels_count: usize,
    pub active_downloads: usize,
    pub state_store_connected: bool,
    pub state_store_memory: Option<String>,
    pub uptime_seconds: u64,
    pub malformed_lines: u64,
    pub stall_timeout_seconds: u64,
}

pub struct DownloadMonitor {
    store: Arc<dyn StateStore>,
    manager: Arc<TunnelManager>,
    config: MonitorConfig,
    tailer: tokio::sync::Mutex<LogTailer>,
    /// Recently seen (request_id, timestamp) pairs per tunnel
    recent: std::sync::Mutex<HashMap<String, Vec<(String, DateTime<Utc>)>>>,
    malformed_lines: AtomicU64,
    running: AtomicBool,
    started: Instant,
}

impl DownloadMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        manager: Arc<TunnelManager>,
        tailer: LogTailer,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            manager,
            config,
            tailer: tokio::sync::Mutex::new(tailer),
            recent: std::sync::Mutex::new(HashMap::new()),
            malformed_lines: AtomicU64::new(0),
            running: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Periodic tick loop until cancelled. Errors never escape: a failed
    /// tick is logged and the next one tries again.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(tick_seconds = self.config.tick_interval.as_secs(),
            "download monitor started");
        self.running.store(true, Ordering::SeqCst);
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = %err, "monitor tick failed");
                    }
                }
            }
        }
        // best effort: persist the read position before going away
        if let Err(err) = self.tailer.lock().await.checkpoint().await {
            tracing::warn!(error = %err, "final log checkpoint failed");
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("download monitor stopped");
    }

    /// One full pass: ingest new log events, evaluate triggers, checkpoint.
    /// Also invoked directly by `POST /admin/cleanup`.
    pub async fn tick(&self) -> Result<TickReport> {
        // a dead store pauses the monitor rather than burning the log stream
        if let Err(err) = self.store.ping().await {
            tracing::warn!(error = %err, "state store unreachable, skipping tick");
            return Ok(TickReport::default());
        }

        let mut report = TickReport::default();
        let lines = {
            let mut tailer = self.tailer.lock().await;
            tailer.poll().await?
        };
        for line in &lines {
            match parse_line(line) {
                Some(event) => {
                    report.events += 1;
                    self.apply_event(&event).await;
                }
                None => {
                    report.malformed += 1;
                    self.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(line = %line, "dropping unparseable log line");
                }
            }
        }

        report.destroyed = self.evaluate_triggers(Utc::now()).await;

        let mut tailer = self.tailer.lock().await;
        tailer.maybe_checkpoint().await?;
        Ok(report)
    }

    /// Fold one log event into its tunnel's record.
    async fn apply_event(&self, event: &AccessLogEvent) {
        let Some((kind, tunnel_id)) = event.tunnel_route() else {
            return;
        };
        let tunnel_id = tunnel_id.to_string();

        let counts_bytes = kind == RouteKind::Download && event.carries_bytes();
        if counts_bytes {
            self.note_connection(&tunnel_id, event);
        } else if event.status_code >= 400 {
            return;
        }

        for _ in 0..UPDATE_ATTEMPTS {
            let loaded = match self.manager.load_raw(&tunnel_id).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    tracing::warn!(tunnel_id = %tunnel_id, error = %err,
                        "failed to load record for log event");
                    return;
                }
            };
            let Some((raw, mut record)) = loaded else {
                // tunnel already destroyed; late log lines are expected
                return;
            };
            if record.status.is_terminal() {
                return;
            }

            record.last_activity_at = Some(match record.last_activity_at {
                Some(prev) => prev.max(event.timestamp),
                None => event.timestamp,
            });

            if counts_bytes {
                let room = record.file_size.saturating_sub(record.bytes_served);
                record.bytes_served += event.body_bytes_sent.min(room);
                if !record.request_ids.iter().any(|id| id == &event.request_id) {
                    if record.request_ids.len() >= MAX_REQUEST_IDS {
                        record.request_ids.remove(0);
                    }
                    record.request_ids.push(event.request_id.clone());
                }
            }
            record.active_connections = self.connection_count(&tunnel_id, event.timestamp);

            match self.manager.swap(&tunnel_id, &raw, &record).await {
                Ok(true) => {
                    if counts_bytes {
                        tracing::debug!(tunnel_id = %tunnel_id,
                            bytes = event.body_bytes_sent,
                            total = record.bytes_served, "recorded download bytes");
                    }
                    return;
                }
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(tunnel_id = %tunnel_id, error = %err,
                        "failed to update record for log event");
                    return;
                }
            }
        }
        tracing::warn!(tunnel_id = %tunnel_id, "gave up updating record after contention");
    }

    /// Evaluate destruction triggers for every live tunnel. More-final
    /// conditions win: expired, then stalled, then completed.
    async fn evaluate_triggers(&self, now: DateTime<Utc>) -> usize {
        let records = match self.manager.list_live().await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list tunnels for trigger pass");
                return 0;
            }
        };

        let mut destroyed = 0;
        for record in records {
            let id = record.tunnel_id.clone();
            let outcome = match record.status {
                TunnelStatus::Provisioning | TunnelStatus::Active => {
                    if now > record.expires_at {
                        self.destroy(&id, DestroyReason::Expired).await
                    } else if self.is_stalled(&record, now) {
                        self.destroy(&id, DestroyReason::Stalled).await
                    } else if record.status == TunnelStatus::Active
                        && record.bytes_served >= record.file_size
                        && !record.request_ids.is_empty()
                    {
                        self.mark_completed(&id, now).await;
                        false
                    } else {
                        false
                    }
                }
                TunnelStatus::Completed => {
                    let deadline = record.grace_deadline.unwrap_or(record.expires_at);
                    if now > deadline {
                        self.destroy(&id, DestroyReason::Completed).await
                    } else {
                        false
                    }
                }
                // terminal record means a destroy was interrupted; finish it
                _ => {
                    self.destroy(&id, DestroyReason::from_status(record.status))
                        .await
                }
            };
            if outcome {
                destroyed += 1;
            }
        }
        destroyed
    }

    fn is_stalled(&self, record: &tunnels::TunnelRecord, now: DateTime<Utc>) -> bool {
        if record.status != TunnelStatus::Active || record.bytes_served == 0 {
            return false;
        }
        let last = record.last_activity_at.unwrap_or(record.created_at);
        (now - last).num_seconds() > self.config.stall_timeout.as_secs() as i64
    }

    async fn destroy(&self, tunnel_id: &str, reason: DestroyReason) -> bool {
        match self.manager.destroy_tunnel(tunnel_id, reason).await {
            Ok(destroyed) => destroyed,
            Err(err) => {
                tracing::error!(tunnel_id = %tunnel_id, reason = reason.as_str(),
                    error = %err, "trigger destroy failed");
                false
            }
        }
    }

    /// Move an active tunnel to completed and start its grace period.
    async fn mark_completed(&self, tunnel_id: &str, now: DateTime<Utc>) {
        for _ in 0..UPDATE_ATTEMPTS {
            let Ok(Some((raw, mut record))) = self.manager.load_raw(tunnel_id).await else {
                return;
            };
            if record.status != TunnelStatus::Active {
                return;
            }
            record.status = TunnelStatus::Completed;
            record.grace_deadline =
                Some(now + chrono::Duration::seconds(self.config.grace_period.as_secs() as i64));
            match self.manager.swap(tunnel_id, &raw, &record).await {
                Ok(true) => {
                    tracing::info!(tunnel_id = %tunnel_id,
                        bytes_served = record.reported_bytes(),
                        grace_seconds = self.config.grace_period.as_secs(),
                        "download complete, grace period started");
                    return;
                }
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(tunnel_id = %tunnel_id, error = %err,
                        "failed to mark tunnel completed");
                    return;
                }
            }
        }
    }

    fn note_connection(&self, tunnel_id: &str, event: &AccessLogEvent) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let entries = recent.entry(tunnel_id.to_string()).or_default();
        entries.push((event.request_id.clone(), event.timestamp));
        if entries.len() > MAX_REQUEST_IDS {
            entries.remove(0);
        }
    }

    /// Distinct request IDs seen inside the connection window. Reported,
    /// not relied on.
    fn connection_count(&self, tunnel_id: &str, now: DateTime<Utc>) -> u32 {
        let window = chrono::Duration::seconds(self.config.connection_window.as_secs() as i64);
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = recent.get_mut(tunnel_id) else {
            return 0;
        };
        entries.retain(|(_, at)| now - *at <= window);
        let mut distinct: Vec<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        distinct.len() as u32
    }

    pub async fn status(&self) -> MonitorStatus {
        let state_store_connected = self.store.ping().await.is_ok();
        let state_store_memory = self.store.memory_usage().await.ok().flatten();
        let live = self.manager.list_live().await.unwrap_or_default();
        let active_downloads = live.iter().filter(|r| r.active_connections > 0).count();
        MonitorStatus {
            monitor_active: self.running.load(Ordering::SeqCst),
            active_tunnels_count: live.len(),
            active_downloads,
            state_store_connected,
            state_store_memory,
            uptime_seconds: self.started.elapsed().as_secs(),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            stall_timeout_seconds: self.config.stall_timeout.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statestore::MemoryStore;
    use std::io::Write;
    use tempfile::TempDir;
    use tunnels::{MemoryEdgeProvider, TunnelRecord};

    struct Fixture {
        monitor: DownloadMonitor,
        manager: Arc<TunnelManager>,
        edge: Arc<MemoryEdgeProvider>,
        log: std::path::PathBuf,
        _library: TempDir,
        _staging: TempDir,
        _logdir: TempDir,
    }

    async fn fixture(config: MonitorConfig) -> Fixture {
        let library = TempDir::new().unwrap();
        std::fs::write(library.path().join("a.txt"), b"hello world!").unwrap();
        std::fs::write(library.path().join("empty.bin"), b"").unwrap();
        let staging = TempDir::new().unwrap();
        let logdir = TempDir::new().unwrap();
        let log = logdir.path().join("access.log");
        std::fs::write(&log, "").unwrap();

        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let edge = Arc::new(MemoryEdgeProvider::new());
        let manager = Arc::new(TunnelManager::new(
            store.clone(),
            edge.clone(),
            library.path().to_path_buf(),
            staging.path().to_path_buf(),
            Duration::from_secs(3600),
            Duration::from_secs(600),
        ));
        let tailer = LogTailer::start(
            log.clone(),
            store.clone(),
            false,
            50,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let monitor = DownloadMonitor::new(store, manager.clone(), tailer, config);
        Fixture {
            monitor,
            manager,
            edge,
            log,
            _library: library,
            _staging: staging,
            _logdir: logdir,
        }
    }

    fn append_log(fx: &Fixture, line: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&fx.log)
            .unwrap();
        writeln!(file, "{line}").unwrap();
    }

    fn download_line(tunnel_id: &str, status: u16, body_bytes: u64, request_id: &str) -> String {
        let ts = Utc::now().format("%d/%b/%Y:%H:%M:%S %z");
        format!(
            r#"203.0.113.9 - - [{ts}] "GET /download-file/{tunnel_id}/a.txt HTTP/1.1" {status} {body_bytes} {body_bytes} "curl/8.0" 0.050 {request_id}"#
        )
    }

    async fn rewrite(fx: &Fixture, id: &str, mutate: impl FnOnce(&mut TunnelRecord)) {
        let (raw, mut record) = fx.manager.load_raw(id).await.unwrap().unwrap();
        mutate(&mut record);
        assert!(fx.manager.swap(id, &raw, &record).await.unwrap());
    }

    #[tokio::test]
    async fn bytes_accumulate_and_complete_with_grace() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        append_log(&fx, &download_line(&id, 206, 5, "req-1"));
        let report = fx.monitor.tick().await.unwrap();
        assert_eq!(report.events, 1);

        let partial = fx.manager.load(&id).await.unwrap().unwrap();
        assert_eq!(partial.bytes_served, 5);
        assert_eq!(partial.status, TunnelStatus::Active);
        assert!(partial.last_activity_at.is_some());

        append_log(&fx, &download_line(&id, 206, 7, "req-2"));
        fx.monitor.tick().await.unwrap();

        let done = fx.manager.load(&id).await.unwrap().unwrap();
        assert_eq!(done.bytes_served, 12);
        assert_eq!(done.status, TunnelStatus::Completed);
        assert!(done.grace_deadline.is_some());
        // route stays up through the grace period
        assert!(fx.edge.has_route(&id));

        // once the grace deadline passes, the tunnel is destroyed
        rewrite(&fx, &id, |r| {
            r.grace_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        })
        .await;
        let report = fx.monitor.tick().await.unwrap();
        assert_eq!(report.destroyed, 1);
        assert!(fx.manager.load(&id).await.unwrap().is_none());
        assert!(!fx.edge.has_route(&id));
        let history = fx.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, "completed");
        assert_eq!(history[0].bytes_served, 12);
    }

    #[tokio::test]
    async fn overshoot_is_capped_at_file_size() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        // overlapping range requests re-send bytes
        append_log(&fx, &download_line(&id, 206, 10, "req-1"));
        append_log(&fx, &download_line(&id, 206, 10, "req-1"));
        fx.monitor.tick().await.unwrap();

        let done = fx.manager.load(&id).await.unwrap().unwrap();
        assert_eq!(done.bytes_served, 12);
        assert_eq!(done.status, TunnelStatus::Completed);
    }

    #[tokio::test]
    async fn courtesy_views_do_not_count_bytes() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        let ts = Utc::now().format("%d/%b/%Y:%H:%M:%S %z");
        append_log(
            &fx,
            &format!(
                r#"203.0.113.9 - - [{ts}] "GET /files/{id}/a.txt HTTP/1.1" 200 900 850 "Mozilla/5.0" 0.010 req-view"#
            ),
        );
        fx.monitor.tick().await.unwrap();

        let after = fx.manager.load(&id).await.unwrap().unwrap();
        assert_eq!(after.bytes_served, 0);
        assert_eq!(after.status, TunnelStatus::Active);
        // but the view still counts as activity
        assert!(after.last_activity_at.is_some());
        assert!(after.request_ids.is_empty());
    }

    #[tokio::test]
    async fn failed_requests_do_not_count_bytes() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        append_log(&fx, &download_line(&id, 404, 150, "req-miss"));
        fx.monitor.tick().await.unwrap();

        let after = fx.manager.load(&id).await.unwrap().unwrap();
        assert_eq!(after.bytes_served, 0);
    }

    #[tokio::test]
    async fn zero_byte_file_completes_on_first_get() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("empty.bin", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        // no download yet: not completed even though bytes_served == file_size
        fx.monitor.tick().await.unwrap();
        assert_eq!(
            fx.manager.load(&id).await.unwrap().unwrap().status,
            TunnelStatus::Active
        );

        let ts = Utc::now().format("%d/%b/%Y:%H:%M:%S %z");
        append_log(
            &fx,
            &format!(
                r#"203.0.113.9 - - [{ts}] "GET /download-file/{id}/empty.bin HTTP/1.1" 200 120 0 "curl/8.0" 0.001 req-empty"#
            ),
        );
        fx.monitor.tick().await.unwrap();
        assert_eq!(
            fx.manager.load(&id).await.unwrap().unwrap().status,
            TunnelStatus::Completed
        );
    }

    #[tokio::test]
    async fn stall_fires_only_after_bytes_moved() {
        let config = MonitorConfig {
            stall_timeout: Duration::from_secs(300),
            ..MonitorConfig::default()
        };
        let fx = fixture(config).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(3600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        // idle but never started: expiry's job, not stall's
        fx.monitor.tick().await.unwrap();
        assert!(fx.manager.load(&id).await.unwrap().is_some());

        // partial download, then silence past the stall threshold
        append_log(&fx, &download_line(&id, 206, 4, "req-1"));
        fx.monitor.tick().await.unwrap();
        rewrite(&fx, &id, |r| {
            r.last_activity_at = Some(Utc::now() - chrono::Duration::seconds(301));
        })
        .await;

        let report = fx.monitor.tick().await.unwrap();
        assert_eq!(report.destroyed, 1);
        assert!(!fx.edge.has_route(&id));
        let history = fx.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, "stalled");
        assert_eq!(history[0].bytes_served, 4);
    }

    #[tokio::test]
    async fn expiry_wins_over_stall() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(3600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        append_log(&fx, &download_line(&id, 206, 4, "req-1"));
        fx.monitor.tick().await.unwrap();
        // both overdue: stall-idle and past the deadline
        rewrite(&fx, &id, |r| {
            r.last_activity_at = Some(Utc::now() - chrono::Duration::seconds(1000));
            r.expires_at = Utc::now() - chrono::Duration::seconds(1);
        })
        .await;

        fx.monitor.tick().await.unwrap();
        let history = fx.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, "expired");
    }

    #[tokio::test]
    async fn undownloaded_tunnel_expires() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        rewrite(&fx, &id, |r| {
            r.expires_at = Utc::now() - chrono::Duration::seconds(1);
        })
        .await;
        let report = fx.monitor.tick().await.unwrap();
        assert_eq!(report.destroyed, 1);
        let history = fx.manager.history(10).await.unwrap();
        assert_eq!(history[0].reason, "expired");
        assert_eq!(history[0].bytes_served, 0);
    }

    #[tokio::test]
    async fn late_log_lines_for_destroyed_tunnels_are_ignored() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();
        fx.manager
            .destroy_tunnel(&id, DestroyReason::Terminated)
            .await
            .unwrap();

        append_log(&fx, &download_line(&id, 200, 12, "req-late"));
        let report = fx.monitor.tick().await.unwrap();
        assert_eq!(report.events, 1);
        assert!(fx.manager.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_lines_are_counted_not_fatal() {
        let fx = fixture(MonitorConfig::default()).await;
        append_log(&fx, "complete garbage");
        append_log(&fx, "more garbage");
        let report = fx.monitor.tick().await.unwrap();
        assert_eq!(report.malformed, 2);
        assert_eq!(fx.monitor.status().await.malformed_lines, 2);
    }

    #[tokio::test]
    async fn status_reports_connections_and_counts() {
        let fx = fixture(MonitorConfig::default()).await;
        let record = fx
            .manager
            .create_tunnel("a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        let id = record.tunnel_id.clone();

        append_log(&fx, &download_line(&id, 206, 2, "req-a"));
        append_log(&fx, &download_line(&id, 206, 2, "req-b"));
        fx.monitor.tick().await.unwrap();

        let after = fx.manager.load(&id).await.unwrap().unwrap();
        assert_eq!(after.active_connections, 2);

        let status = fx.monitor.status().await;
        assert_eq!(status.active_tunnels_count, 1);
        assert_eq!(status.active_downloads, 1);
        assert!(status.state_store_connected);
    }
}
