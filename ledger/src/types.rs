//! Core ledger types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash;

/// `previous_hash` of the entry at sequence 0.
///
/// 64 hex zeros; never the SHA-256 of real data.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened. Serialized as SCREAMING_SNAKE_CASE tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    AlertCreated,
    AlertTriaged,
    AlertAssigned,
    AlertAcknowledged,
    AlertResolved,
    AlertCancelled,
    AlertEscalated,
    /// Acknowledgment window elapsed; alert returned to triage
    AlertAckTimeout,
    /// Forced release of the assigned responder; alert returned to triage
    AlertReverted,
    AlertArchived,
    ResponderRegistered,
    ResponderAvailable,
    ResponderDispatched,
    ResponderReleased,
    ResponderOffDuty,
    /// Observation: a dispatch attempt found nobody to send
    DispatchNoCandidate,
}

impl AuditAction {
    /// Stable tag used in the entry digest and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlertCreated => "ALERT_CREATED",
            Self::AlertTriaged => "ALERT_TRIAGED",
            Self::AlertAssigned => "ALERT_ASSIGNED",
            Self::AlertAcknowledged => "ALERT_ACKNOWLEDGED",
            Self::AlertResolved => "ALERT_RESOLVED",
            Self::AlertCancelled => "ALERT_CANCELLED",
            Self::AlertEscalated => "ALERT_ESCALATED",
            Self::AlertAckTimeout => "ALERT_ACK_TIMEOUT",
            Self::AlertReverted => "ALERT_REVERTED",
            Self::AlertArchived => "ALERT_ARCHIVED",
            Self::ResponderRegistered => "RESPONDER_REGISTERED",
            Self::ResponderAvailable => "RESPONDER_AVAILABLE",
            Self::ResponderDispatched => "RESPONDER_DISPATCHED",
            Self::ResponderReleased => "RESPONDER_RELEASED",
            Self::ResponderOffDuty => "RESPONDER_OFF_DUTY",
            Self::DispatchNoCandidate => "DISPATCH_NO_CANDIDATE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry waiting to be sequenced and chained.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub actor_id: String,
    pub action: AuditAction,
    pub subject_id: String,
    pub payload: serde_json::Value,
}

impl PendingEntry {
    pub fn new(
        actor_id: impl Into<String>,
        action: AuditAction,
        subject_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            action,
            subject_id: subject_id.into(),
            payload,
        }
    }
}

/// A committed, immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the global order, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Who caused the change
    pub actor_id: String,
    pub action: AuditAction,
    /// Alert or responder the entry is about
    pub subject_id: String,
    /// Event payload, kept so the log can be replayed
    pub payload: serde_json::Value,
    /// SHA-256 (hex) of the canonical payload encoding
    pub payload_hash: String,
    /// `entry_hash` of the prior entry, or [`GENESIS_HASH`]
    pub previous_hash: String,
    /// SHA-256 (hex) over every field above except the raw payload
    pub entry_hash: String,
}

impl AuditEntry {
    /// Build and seal an entry at `sequence`, chained onto `previous_hash`.
    pub fn seal(
        sequence: u64,
        timestamp: DateTime<Utc>,
        pending: PendingEntry,
        previous_hash: impl Into<String>,
    ) -> Self {
        let payload_hash = hash::payload_hash(&pending.payload);
        let mut entry = Self {
            sequence,
            timestamp,
            actor_id: pending.actor_id,
            action: pending.action,
            subject_id: pending.subject_id,
            payload: pending.payload,
            payload_hash,
            previous_hash: previous_hash.into(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_entry_hash();
        entry
    }

    /// Recompute the entry digest from the stored fields.
    pub fn compute_entry_hash(&self) -> String {
        hash::entry_hash(
            self.sequence,
            &self.timestamp,
            &self.actor_id,
            self.action.as_str(),
            &self.subject_id,
            &self.payload_hash,
            &self.previous_hash,
        )
    }

    /// Check both digests against the stored content.
    pub fn is_intact(&self) -> bool {
        hash::payload_hash(&self.payload) == self.payload_hash
            && self.compute_entry_hash() == self.entry_hash
    }
}

/// Tail of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHead {
    /// Sequence of the last entry, `None` when empty
    pub sequence: Option<u64>,
    /// Hash the next entry will chain onto
    pub hash: String,
}

impl LedgerHead {
    pub fn genesis() -> Self {
        Self {
            sequence: None,
            hash: GENESIS_HASH.to_string(),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.map(|s| s + 1).unwrap_or(0)
    }
}

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub valid: bool,
    /// First sequence that failed, if any
    pub broken_at_seq: Option<u64>,
    /// Entries examined before stopping
    pub checked: u64,
}

impl VerifyReport {
    pub fn valid(checked: u64) -> Self {
        Self {
            valid: true,
            broken_at_seq: None,
            checked,
        }
    }

    pub fn broken(at: u64, checked: u64) -> Self {
        Self {
            valid: false,
            broken_at_seq: Some(at),
            checked,
        }
    }
}

/// Ledger error types.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Backing storage refused the write or read
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored line could not be decoded
    #[error("Corrupt ledger record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Invalid range {from}..={to} (tail: {tail:?})")]
    InvalidRange { from: u64, to: u64, tail: Option<u64> },

    #[error("Ledger integrity violation at sequence {0}")]
    IntegrityViolation(u64),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
