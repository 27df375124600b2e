//! Restartable access-log tailer.
//!
//! The log is consumed as a lazy stream: each poll reads whatever the static
//! server appended since the last one. Rotation is detected by inode change,
//! truncation by size regression; either resets the read position to the
//! start of the new file. The `(inode, offset)` pair is checkpointed to the
//! state store so a restart resumes with bounded loss instead of replaying
//! or skipping the whole file.

use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use statestore::StateStore;

use crate::Result;

const CHECKPOINT_KEY: &str = "monitor:log_checkpoint";

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    inode: u64,
    offset: u64,
}

pub struct LogTailer {
    path: PathBuf,
    store: Arc<dyn StateStore>,
    inode: u64,
    offset: u64,
    /// Bytes of an incomplete trailing line, carried between polls
    partial: String,
    events_since_checkpoint: usize,
    last_checkpoint: Instant,
    checkpoint_every_events: usize,
    checkpoint_every: Duration,
}

impl LogTailer {
    /// Open a tailer over `path`.
    ///
    /// Fresh starts seek to the end of the log; with `resume` the persisted
    /// checkpoint is used instead, provided it still refers to the current
    /// file.
    pub async fn start(
        path: PathBuf,
        store: Arc<dyn StateStore>,
        resume: bool,
        checkpoint_every_events: usize,
        checkpoint_every: Duration,
    ) -> Result<Self> {
        let current = stat(&path)?;
        let (inode, len) = current.unwrap_or((0, 0));

        let mut offset = len;
        if resume {
            offset = match load_checkpoint(store.as_ref()).await? {
                Some(cp) if cp.inode == inode && cp.offset <= len => {
                    tracing::info!(offset = cp.offset, "resuming log tail from checkpoint");
                    cp.offset
                }
                Some(_) => {
                    tracing::info!("log rotated while down, tailing from start");
                    0
                }
                None => len,
            };
        }

        Ok(Self {
            path,
            store,
            inode,
            offset,
            partial: String::new(),
            events_since_checkpoint: 0,
            last_checkpoint: Instant::now(),
            checkpoint_every_events,
            checkpoint_every,
        })
    }

    /// Read newly appended complete lines. An absent log file just yields
    /// nothing; the static server may not have started yet.
    pub async fn poll(&mut self) -> Result<Vec<String>> {
        let Some((inode, len)) = stat(&self.path)? else {
            return Ok(Vec::new());
        };

        if inode != self.inode {
            tracing::info!(old_inode = self.inode, new_inode = inode, "access log rotated");
            self.inode = inode;
            self.offset = 0;
            self.partial.clear();
        } else if len < self.offset {
            tracing::info!(len, offset = self.offset, "access log truncated");
            self.offset = 0;
            self.partial.clear();
        }

        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        let read = (&mut file)
            .take(len - self.offset)
            .read_to_end(&mut buf)
            .await?;
        self.offset += read as u64;
        self.partial.push_str(&String::from_utf8_lossy(&buf));

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let rest = self.partial.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.truncate(pos);
            let line = line.trim_end().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }

        self.events_since_checkpoint += lines.len();
        Ok(lines)
    }

    /// Persist the read position if the cadence thresholds are due.
    pub async fn maybe_checkpoint(&mut self) -> Result<()> {
        if self.events_since_checkpoint >= self.checkpoint_every_events
            || (self.events_since_checkpoint > 0
                && self.last_checkpoint.elapsed() >= self.checkpoint_every)
        {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Persist the read position unconditionally.
    pub async fn checkpoint(&mut self) -> Result<()> {
        let cp = Checkpoint {
            inode: self.inode,
            offset: self.offset,
        };
        let json = serde_json::to_string(&cp).unwrap_or_default();
        self.store.set(CHECKPOINT_KEY, &json, None).await?;
        self.events_since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

async fn load_checkpoint(store: &dyn StateStore) -> Result<Option<Checkpoint>> {
    let Some(raw) = store.get(CHECKPOINT_KEY).await? else {
        return Ok(None);
    };
    Ok(serde_json::from_str(&raw).ok())
}

fn stat(path: &PathBuf) -> std::io::Result<Option<(u64, u64)>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some((meta.ino(), meta.len()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
