//! The audit chain: one serialized append path, concurrent readers.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::store::LedgerStore;
use crate::types::{
    AuditEntry, LedgerError, LedgerHead, PendingEntry, Result, VerifyReport, GENESIS_HASH,
};

/// Append-only, hash-chained audit log.
///
/// Appends take `append_lock` for their whole duration, so sequence
/// assignment, chaining and the storage write happen in one global order.
/// Readers only contend with the final in-memory push of a committed batch.
///
/// The storage write and the in-memory push run on a spawned task that owns
/// the append guard, so a caller that stops polling cannot leave the store
/// and the in-memory chain out of step.
pub struct AuditLedger {
    store: Arc<dyn LedgerStore>,
    /// Committed entries; index == sequence
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    append_lock: Arc<Mutex<()>>,
}

impl AuditLedger {
    /// Open a ledger over `store`, loading whatever it already holds.
    pub async fn open(store: Arc<dyn LedgerStore>) -> Result<Self> {
        let entries = store.load().await?;
        info!(entries = entries.len(), "Audit ledger opened");
        Ok(Self {
            store,
            entries: Arc::new(RwLock::new(entries)),
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Open and refuse to continue unless the whole chain verifies.
    pub async fn open_verified(store: Arc<dyn LedgerStore>) -> Result<Self> {
        let ledger = Self::open(store).await?;
        let report = ledger.verify_all().await;
        if let Some(seq) = report.broken_at_seq {
            error!(sequence = seq, "Audit ledger failed verification on open");
            return Err(LedgerError::IntegrityViolation(seq));
        }
        Ok(ledger)
    }

    /// Append a single entry.
    pub async fn append(&self, pending: PendingEntry) -> Result<AuditEntry> {
        let mut sealed = self.append_batch(vec![pending]).await?;
        sealed
            .pop()
            .ok_or_else(|| LedgerError::Storage("empty append result".to_string()))
    }

    /// Append several entries as one unit: all are persisted or none are.
    pub async fn append_batch(&self, pending: Vec<PendingEntry>) -> Result<Vec<AuditEntry>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let guard = Arc::clone(&self.append_lock).lock_owned().await;

        let mut head = self.head().await;
        let timestamp = Utc::now();
        let mut sealed = Vec::with_capacity(pending.len());
        for p in pending {
            let entry = AuditEntry::seal(head.next_sequence(), timestamp, p, head.hash.clone());
            head = LedgerHead {
                sequence: Some(entry.sequence),
                hash: entry.entry_hash.clone(),
            };
            sealed.push(entry);
        }

        let store = Arc::clone(&self.store);
        let entries = Arc::clone(&self.entries);
        let commit = tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = store.append(&sealed).await {
                error!(
                    error = %e,
                    first_sequence = sealed[0].sequence,
                    count = sealed.len(),
                    "Ledger append failed"
                );
                return Err(e);
            }
            entries.write().await.extend(sealed.iter().cloned());
            Ok(sealed)
        });

        let sealed = commit
            .await
            .map_err(|e| LedgerError::Storage(format!("append task failed: {}", e)))??;

        for entry in &sealed {
            debug!(
                sequence = entry.sequence,
                action = %entry.action,
                subject = %entry.subject_id,
                "Audit entry appended"
            );
        }

        Ok(sealed)
    }

    /// Current tail of the chain.
    pub async fn head(&self) -> LedgerHead {
        let entries = self.entries.read().await;
        match entries.last() {
            Some(last) => LedgerHead {
                sequence: Some(last.sequence),
                hash: last.entry_hash.clone(),
            },
            None => LedgerHead::genesis(),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Entry at `sequence`.
    pub async fn get(&self, sequence: u64) -> Option<AuditEntry> {
        let entries = self.entries.read().await;
        entries.get(sequence as usize).cloned()
    }

    /// Entries in `from..=to`, clamped to the tail.
    pub async fn range(&self, from: u64, to: u64) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        if from > to || from as usize >= entries.len() {
            return Vec::new();
        }
        let end = (to as usize).min(entries.len() - 1);
        entries[from as usize..=end].to_vec()
    }

    /// Every entry about `subject_id`, oldest first.
    pub async fn entries_for_subject(&self, subject_id: &str) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect()
    }

    /// Copy of the whole log, oldest first.
    pub async fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    /// Verify the chain over `from..=to`.
    ///
    /// `to` past the tail is clamped. A start past the tail, or after `to`,
    /// is an error. An empty ledger verifies trivially from 0.
    pub async fn verify(&self, from: u64, to: u64) -> Result<VerifyReport> {
        let entries = self.entries.read().await;

        if entries.is_empty() {
            if from == 0 {
                return Ok(VerifyReport::valid(0));
            }
            return Err(LedgerError::InvalidRange { from, to, tail: None });
        }

        let tail = entries.len() as u64 - 1;
        if from > to || from > tail {
            return Err(LedgerError::InvalidRange {
                from,
                to,
                tail: Some(tail),
            });
        }

        let report = verify_entries(&entries, from, to.min(tail));
        if let Some(seq) = report.broken_at_seq {
            error!(sequence = seq, from, to, "Audit chain integrity violation");
        }
        Ok(report)
    }

    /// Verify from genesis to the tail.
    pub async fn verify_all(&self) -> VerifyReport {
        let entries = self.entries.read().await;
        if entries.is_empty() {
            return VerifyReport::valid(0);
        }
        verify_entries(&entries, 0, entries.len() as u64 - 1)
    }
}

/// Check entries `from..=to` of a log whose index is its sequence.
///
/// Each entry must sit at its own index, carry intact payload and entry
/// digests, and link to the entry before it (genesis for sequence 0).
/// Callers guarantee `from <= to < entries.len()`.
pub fn verify_entries(entries: &[AuditEntry], from: u64, to: u64) -> VerifyReport {
    let mut checked = 0;
    for idx in from..=to {
        let entry = &entries[idx as usize];
        let expected_prev = if idx == 0 {
            GENESIS_HASH
        } else {
            entries[idx as usize - 1].entry_hash.as_str()
        };

        let ok = entry.sequence == idx && entry.previous_hash == expected_prev && entry.is_intact();
        if !ok {
            return VerifyReport::broken(idx, checked);
        }
        checked += 1;
    }
    VerifyReport::valid(checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileLedgerStore, MemoryLedgerStore};
    use crate::types::AuditAction;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn pending(subject: &str, action: AuditAction) -> PendingEntry {
        PendingEntry::new("dispatcher-1", action, subject, json!({"subject": subject}))
    }

    async fn memory_ledger() -> AuditLedger {
        AuditLedger::open(Arc::new(MemoryLedgerStore::new()))
            .await
            .unwrap()
    }

    /// Store that can be told to fail.
    struct FlakyStore {
        inner: MemoryLedgerStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn append(&self, entries: &[AuditEntry]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LedgerError::Storage("disk full".to_string()));
            }
            self.inner.append(entries).await
        }

        async fn load(&self) -> Result<Vec<AuditEntry>> {
            self.inner.load().await
        }
    }

    /// File store that stalls before each write.
    struct SlowFileStore {
        inner: FileLedgerStore,
        delay: Duration,
    }

    #[async_trait]
    impl LedgerStore for SlowFileStore {
        async fn append(&self, entries: &[AuditEntry]) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.append(entries).await
        }

        async fn load(&self) -> Result<Vec<AuditEntry>> {
            self.inner.load().await
        }
    }

    #[tokio::test]
    async fn test_append_chains_entries() {
        let ledger = memory_ledger().await;

        let first = ledger
            .append(pending("alert-1", AuditAction::AlertCreated))
            .await
            .unwrap();
        let second = ledger
            .append(pending("alert-1", AuditAction::AlertTriaged))
            .await
            .unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.previous_hash, first.entry_hash);

        let head = ledger.head().await;
        assert_eq!(head.sequence, Some(1));
        assert_eq!(head.hash, second.entry_hash);
        assert!(ledger.verify(0, 1).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_batch_is_contiguous() {
        let ledger = memory_ledger().await;
        ledger
            .append(pending("alert-1", AuditAction::AlertCreated))
            .await
            .unwrap();

        let batch = ledger
            .append_batch(vec![
                pending("alert-1", AuditAction::AlertAssigned),
                pending("responder-1", AuditAction::ResponderDispatched),
            ])
            .await
            .unwrap();

        assert_eq!(batch[0].sequence, 1);
        assert_eq!(batch[1].sequence, 2);
        assert_eq!(batch[1].previous_hash, batch[0].entry_hash);
        assert_eq!(ledger.verify_all().await, VerifyReport::valid(3));
    }

    #[tokio::test]
    async fn test_failed_append_leaves_chain_untouched() {
        let store = Arc::new(FlakyStore {
            inner: MemoryLedgerStore::new(),
            failing: AtomicBool::new(false),
        });
        let ledger = AuditLedger::open(store.clone()).await.unwrap();

        let first = ledger
            .append(pending("alert-1", AuditAction::AlertCreated))
            .await
            .unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let result = ledger
            .append_batch(vec![
                pending("alert-1", AuditAction::AlertAssigned),
                pending("responder-1", AuditAction::ResponderDispatched),
            ])
            .await;
        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert_eq!(ledger.len().await, 1);
        assert_eq!(ledger.head().await.hash, first.entry_hash);

        store.failing.store(false, Ordering::SeqCst);
        let next = ledger
            .append(pending("alert-1", AuditAction::AlertAssigned))
            .await
            .unwrap();
        assert_eq!(next.sequence, 1);
        assert_eq!(next.previous_hash, first.entry_hash);
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let ledger = memory_ledger().await;
        for i in 0..5 {
            ledger
                .append(pending(&format!("alert-{}", i), AuditAction::AlertCreated))
                .await
                .unwrap();
        }

        let mut entries = ledger.snapshot().await;
        entries[2].payload = json!({"subject": "forged"});

        let tampered = AuditLedger::open(Arc::new(MemoryLedgerStore::with_entries(entries)))
            .await
            .unwrap();
        let report = tampered.verify(0, 4).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at_seq, Some(2));
        assert_eq!(report.checked, 2);

        // Range before the damage is still fine
        assert!(tampered.verify(0, 1).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_verify_detects_removed_entry() {
        let ledger = memory_ledger().await;
        for i in 0..4 {
            ledger
                .append(pending(&format!("alert-{}", i), AuditAction::AlertCreated))
                .await
                .unwrap();
        }

        let mut entries = ledger.snapshot().await;
        entries.remove(1);

        let tampered = AuditLedger::open(Arc::new(MemoryLedgerStore::with_entries(entries)))
            .await
            .unwrap();
        assert_eq!(tampered.verify_all().await.broken_at_seq, Some(1));
    }

    #[tokio::test]
    async fn test_verify_detects_rehashed_entry() {
        let ledger = memory_ledger().await;
        for i in 0..3 {
            ledger
                .append(pending(&format!("alert-{}", i), AuditAction::AlertCreated))
                .await
                .unwrap();
        }

        // Forge entry 1 and recompute its own digests; the link from entry 2 breaks.
        let mut entries = ledger.snapshot().await;
        entries[1].actor_id = "intruder".to_string();
        entries[1].entry_hash = entries[1].compute_entry_hash();

        let tampered = AuditLedger::open(Arc::new(MemoryLedgerStore::with_entries(entries)))
            .await
            .unwrap();
        assert_eq!(tampered.verify_all().await.broken_at_seq, Some(2));
    }

    #[tokio::test]
    async fn test_verify_ranges() {
        let ledger = memory_ledger().await;
        assert_eq!(ledger.verify(0, 10).await.unwrap(), VerifyReport::valid(0));
        assert!(matches!(
            ledger.verify(1, 10).await,
            Err(LedgerError::InvalidRange { tail: None, .. })
        ));

        for i in 0..3 {
            ledger
                .append(pending(&format!("alert-{}", i), AuditAction::AlertCreated))
                .await
                .unwrap();
        }

        assert_eq!(ledger.verify(1, 100).await.unwrap(), VerifyReport::valid(2));
        assert!(ledger.verify(3, 5).await.is_err());
        assert!(ledger.verify(2, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_subject_queries() {
        let ledger = memory_ledger().await;
        ledger
            .append(pending("alert-1", AuditAction::AlertCreated))
            .await
            .unwrap();
        ledger
            .append(pending("alert-2", AuditAction::AlertCreated))
            .await
            .unwrap();
        ledger
            .append(pending("alert-1", AuditAction::AlertTriaged))
            .await
            .unwrap();

        let trail = ledger.entries_for_subject("alert-1").await;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].action, AuditAction::AlertCreated);
        assert_eq!(trail[1].action, AuditAction::AlertTriaged);

        assert_eq!(ledger.range(1, 2).await.len(), 2);
        assert!(ledger.range(5, 9).await.is_empty());
        assert_eq!(ledger.get(2).await.unwrap().subject_id, "alert-1");
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_chain() {
        let ledger = Arc::new(memory_ledger().await);

        let mut handles = Vec::new();
        for i in 0..32 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .append(pending(&format!("alert-{}", i), AuditAction::AlertCreated))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.len().await, 32);
        assert_eq!(ledger.verify_all().await, VerifyReport::valid(32));
    }

    #[tokio::test]
    async fn test_file_backed_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = AuditLedger::open(Arc::new(FileLedgerStore::new(&path)))
                .await
                .unwrap();
            ledger
                .append(pending("alert-1", AuditAction::AlertCreated))
                .await
                .unwrap();
            ledger
                .append(pending("alert-1", AuditAction::AlertTriaged))
                .await
                .unwrap();
        }

        let reopened = AuditLedger::open_verified(Arc::new(FileLedgerStore::new(&path)))
            .await
            .unwrap();
        assert_eq!(reopened.len().await, 2);

        let next = reopened
            .append(pending("alert-1", AuditAction::AlertCancelled))
            .await
            .unwrap();
        assert_eq!(next.sequence, 2);
        assert!(reopened.verify_all().await.valid);
    }

    #[tokio::test]
    async fn test_open_verified_rejects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = AuditLedger::open(Arc::new(FileLedgerStore::new(&path)))
                .await
                .unwrap();
            ledger
                .append(pending("alert-1", AuditAction::AlertCreated))
                .await
                .unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::write(&path, content.replace("dispatcher-1", "dispatcher-2"))
            .await
            .unwrap();

        let result = AuditLedger::open_verified(Arc::new(FileLedgerStore::new(&path))).await;
        assert!(matches!(result, Err(LedgerError::IntegrityViolation(0))));
    }

    #[tokio::test]
    async fn test_abandoned_append_still_lands_in_memory_and_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let store = Arc::new(SlowFileStore {
            inner: FileLedgerStore::new(&path),
            delay: Duration::from_millis(20),
        });
        let ledger = AuditLedger::open(store).await.unwrap();

        // Caller gives up while the write is still pending
        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            ledger.append(pending("responder-1", AuditAction::ResponderRegistered)),
        )
        .await;
        assert!(abandoned.is_err());

        // Queues behind the abandoned batch and chains onto it
        let next = ledger
            .append(pending("responder-2", AuditAction::ResponderRegistered))
            .await
            .unwrap();
        assert_eq!(next.sequence, 1);
        assert_eq!(ledger.len().await, 2);

        let reopened = AuditLedger::open_verified(Arc::new(FileLedgerStore::new(&path)))
            .await
            .unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.head().await, ledger.head().await);
    }
}
