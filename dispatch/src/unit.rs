//! Unit of work: staged snapshots plus the audit entries that justify them.

use ledger::{AuditAction, PendingEntry};

use crate::error::{DispatchError, Result};
use crate::replay::AuditPayload;
use crate::types::{Alert, Responder};

/// One staged change and its entry.
#[derive(Debug, Clone)]
pub struct StagedChange {
    pub entry: PendingEntry,
    pub alert: Option<Alert>,
    pub responder: Option<Responder>,
}

/// Changes that commit together or not at all.
///
/// Nothing here touches shared state. The engine appends every entry in one
/// ledger batch and applies the snapshots only when that append succeeds.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    changes: Vec<StagedChange>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an entry about `subject_id`.
    pub fn record(
        &mut self,
        actor_id: &str,
        action: AuditAction,
        subject_id: &str,
        payload: AuditPayload,
    ) -> Result<()> {
        let value = serde_json::to_value(&payload).map_err(|e| {
            DispatchError::InvalidRequest(format!("unencodable audit payload: {}", e))
        })?;

        self.changes.push(StagedChange {
            entry: PendingEntry::new(actor_id, action, subject_id, value),
            alert: payload.alert,
            responder: payload.responder,
        });
        Ok(())
    }

    /// Stage an alert snapshot.
    pub fn alert(
        &mut self,
        actor_id: &str,
        action: AuditAction,
        alert: &Alert,
        detail: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut payload = AuditPayload::alert(alert);
        payload.detail = detail;
        self.record(actor_id, action, &alert.id, payload)
    }

    /// Stage a responder snapshot.
    pub fn responder(
        &mut self,
        actor_id: &str,
        action: AuditAction,
        responder: &Responder,
        detail: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut payload = AuditPayload::responder(responder);
        payload.detail = detail;
        self.record(actor_id, action, &responder.id, payload)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<StagedChange> {
        self.changes
    }
}
