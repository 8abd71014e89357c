//! Error taxonomy for the dispatch engine.

use ledger::LedgerError;

use crate::types::AlertStatus;
use crate::zones::ZoneError;

/// Dispatch error types.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Requested state change is illegal from the current state
    #[error("Invalid transition for alert {alert_id}: {from} -> {to}")]
    InvalidTransition {
        alert_id: String,
        from: AlertStatus,
        to: AlertStatus,
    },

    /// Responder was not available when the assignment was attempted
    #[error("Responder unavailable: {0}")]
    ResponderUnavailable(String),

    /// Acknowledgment from a responder who is not assigned to the alert
    #[error("Responder {responder_id} is not assigned to alert {alert_id}")]
    ResponderMismatch {
        alert_id: String,
        responder_id: String,
    },

    /// The audit append failed; nothing was applied
    #[error("Ledger append failed: {0}")]
    LedgerAppendFailed(#[source] LedgerError),

    #[error("Ledger integrity violation at sequence {0}")]
    LedgerIntegrityViolation(u64),

    /// Idempotency token reused with different parameters
    #[error("Duplicate request: idempotency token {0} was used with different parameters")]
    DuplicateRequest(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    #[error("Responder not found: {0}")]
    ResponderNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Zone configuration error: {0}")]
    Zone(#[from] ZoneError),

    /// Ledger payload could not be replayed into state
    #[error("Replay failed at sequence {sequence}: {reason}")]
    Replay { sequence: u64, reason: String },

    /// A command task panicked or was aborted
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable tag for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ResponderUnavailable(_) => "RESPONDER_UNAVAILABLE",
            Self::ResponderMismatch { .. } => "RESPONDER_MISMATCH",
            Self::LedgerAppendFailed(_) => "LEDGER_APPEND_FAILED",
            Self::LedgerIntegrityViolation(_) => "LEDGER_INTEGRITY_VIOLATION",
            Self::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            Self::AlertNotFound(_) => "ALERT_NOT_FOUND",
            Self::ResponderNotFound(_) => "RESPONDER_NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Zone(_) => "ZONE_CONFIGURATION",
            Self::Replay { .. } => "REPLAY_FAILED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResponderUnavailable(_) | Self::LedgerAppendFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
