//! Storage backends for the ledger.
//!
//! Stores are insert-only: the trait offers no way to update or delete an
//! entry once written.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::types::{AuditEntry, LedgerError, Result};

/// Durable home of committed entries.
///
/// `append` receives a whole batch and must persist all of it or none of it.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a batch of sealed entries, in order.
    async fn append(&self, entries: &[AuditEntry]) -> Result<()>;

    /// Load every persisted entry, in sequence order.
    async fn load(&self) -> Result<Vec<AuditEntry>>;
}

/// Volatile store for tests and single-process deployments.
pub struct MemoryLedgerStore {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Seed the store with pre-existing entries (used to load exported logs).
    pub fn with_entries(entries: Vec<AuditEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, entries: &[AuditEntry]) -> Result<()> {
        let mut stored = self.entries.write().await;
        stored.extend_from_slice(entries);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.read().await.clone())
    }
}

/// Append-only JSON-lines file, one entry per line.
///
/// A batch that fails part-way is cut back off the file. If even that
/// fails the store refuses further appends until it is reopened.
pub struct FileLedgerStore {
    path: PathBuf,
    /// fsync after every batch
    sync_writes: bool,
    write_lock: Mutex<()>,
    failed: AtomicBool,
    /// Write only this many bytes of the next batch, then fail
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl FileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: true,
            write_lock: Mutex::new(()),
            failed: AtomicBool::new(false),
            #[cfg(test)]
            fail_after: None,
        }
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once a torn batch could not be removed.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    async fn write_batch(&self, file: &mut File, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after {
            file.write_all(&buf[..limit.min(buf.len())]).await?;
            file.flush().await?;
            return Err(io::Error::other("injected write failure"));
        }

        file.write_all(buf).await?;
        file.flush().await?;
        if self.sync_writes {
            file.sync_data().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn append(&self, entries: &[AuditEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // Encode everything before touching the file so a bad entry cannot
        // leave half a batch behind.
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;

        if self.is_failed() {
            return Err(LedgerError::Storage(format!(
                "ledger file {} holds a partial batch",
                self.path.display()
            )));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let committed_len = file.metadata().await?.len();

        if let Err(e) = self.write_batch(&mut file, &buf).await {
            error!(
                path = %self.path.display(),
                error = %e,
                committed_len,
                "Ledger write failed, truncating partial batch"
            );
            if let Err(trunc) = file.set_len(committed_len).await {
                self.failed.store(true, Ordering::SeqCst);
                error!(
                    path = %self.path.display(),
                    error = %trunc,
                    "Could not truncate partial batch, ledger file is unusable"
                );
            }
            return Err(e.into());
        }

        debug!(
            path = %self.path.display(),
            count = entries.len(),
            "Ledger batch written"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Vec<AuditEntry>> {
        if !fs::try_exists(&self.path).await? {
            info!(path = %self.path.display(), "Ledger file not found, starting empty");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry =
                serde_json::from_str(line).map_err(|e| LedgerError::Corrupt {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            entries.push(entry);
        }

        info!(
            path = %self.path.display(),
            count = entries.len(),
            "Ledger loaded"
        );
        Ok(entries)
    }
}
