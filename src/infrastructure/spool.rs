use crate::domain::queue::QueueName;
use crate::error::{PipelineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// A persistent message as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub body: Vec<u8>,
    pub delivery_count: u32,
}

/// Directory-backed storage for persistent messages, one file per message.
///
/// Records live at `<root>/<queue>/<id>.json`. Ids start with the publish
/// time in nanoseconds, so a sorted listing is in publish order, followed by
/// the process id and a counter, so several processes can share one spool.
/// A record exists from publish until the message is acked.
#[derive(Debug)]
pub struct Spool {
    root: PathBuf,
    next_seq: AtomicU64,
}

impl Spool {
    /// Opens or creates the spool directory.
    pub async fn open(root: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            PipelineError::Transport(format!("cannot open spool {}: {}", root.display(), e))
        })?;
        Ok(Self {
            root,
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn next_id(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:020}-{:010}-{seq:08}", std::process::id())
    }

    fn queue_dir(&self, queue: QueueName) -> PathBuf {
        self.root.join(queue.as_str())
    }

    fn record_path(&self, queue: QueueName, id: &str) -> PathBuf {
        self.queue_dir(queue).join(format!("{id}.json"))
    }

    pub async fn prepare(&self, queue: QueueName) -> Result<()> {
        tokio::fs::create_dir_all(self.queue_dir(queue)).await?;
        Ok(())
    }

    /// Writes a record through a temporary file so a concurrent scan never
    /// reads half of it.
    pub async fn write(&self, queue: QueueName, id: &str, record: &SpoolRecord) -> Result<()> {
        let bytes =
            serde_json::to_vec(record).map_err(|e| PipelineError::Transport(e.to_string()))?;
        let staging = self.queue_dir(queue).join(format!("{id}.tmp"));
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, self.record_path(queue, id)).await?;
        Ok(())
    }

    /// Deletes a record. One already removed by another process is fine.
    pub async fn remove(&self, queue: QueueName, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(queue, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the records of a queue whose ids are not in `known`, oldest
    /// first. Unreadable records come back as `None` so callers can remember
    /// and skip them.
    pub async fn scan(
        &self,
        queue: QueueName,
        known: &HashSet<String>,
    ) -> Result<Vec<(String, Option<SpoolRecord>)>> {
        let mut entries = match tokio::fs::read_dir(self.queue_dir(queue)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !known.contains(id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.record_path(queue, &id);
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => records.push((id, Some(record))),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping corrupt spool record");
                        records.push((id, None));
                    }
                },
                // Acked by another process since the listing.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }
}
