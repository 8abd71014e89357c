//! Events published after a unit of work commits.

use chrono::{DateTime, Utc};
use ledger::AuditAction;
use serde::{Deserialize, Serialize};

use crate::types::{Alert, Responder};

/// One committed audit entry, with the state it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor_id: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<Responder>,
}

impl EngineEvent {
    /// Whether this event tells a responder about a new assignment.
    pub fn is_assignment(&self) -> bool {
        self.action == AuditAction::ResponderDispatched
    }
}
