//! Ledger payloads and state reconstruction.
//!
//! Every entry the engine writes carries an [`AuditPayload`] holding the
//! post-change snapshot of the alert or responder it touched. Replaying the
//! log from genesis and keeping the last snapshot per id reproduces the
//! materialized tables exactly.

use ledger::{AuditAction, AuditEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DispatchError, Result};
use crate::idempotency::{CompletedCommand, IdempotencyRecord};
use crate::types::{Alert, AlertStatus, Responder};

/// Payload stored with each audit entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<Responder>,
    /// Free-form context: reasons, candidate counts, prior values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencyRecord>,
}

impl AuditPayload {
    pub fn alert(alert: &Alert) -> Self {
        Self {
            alert: Some(alert.clone()),
            ..Default::default()
        }
    }

    pub fn responder(responder: &Responder) -> Self {
        Self {
            responder: Some(responder.clone()),
            ..Default::default()
        }
    }

    /// No state change, only context.
    pub fn observation(detail: serde_json::Value) -> Self {
        Self {
            detail: Some(detail),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_idempotency(mut self, token: &str, fingerprint: &str) -> Self {
        self.idempotency = Some(IdempotencyRecord {
            token: token.to_string(),
            fingerprint: fingerprint.to_string(),
        });
        self
    }
}

/// Tables rebuilt from the ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedState {
    pub alerts: BTreeMap<String, Alert>,
    pub responders: BTreeMap<String, Responder>,
    /// Commands completed under an idempotency token
    pub tokens: BTreeMap<String, CompletedCommand>,
}

/// Rebuild state by replaying `entries` from genesis.
pub fn rebuild(entries: &[AuditEntry]) -> Result<MaterializedState> {
    let mut state = MaterializedState::default();

    for entry in entries {
        let payload: AuditPayload =
            serde_json::from_value(entry.payload.clone()).map_err(|e| DispatchError::Replay {
                sequence: entry.sequence,
                reason: e.to_string(),
            })?;

        if let Some(alert) = payload.alert {
            if alert.id != entry.subject_id {
                return Err(DispatchError::Replay {
                    sequence: entry.sequence,
                    reason: format!(
                        "alert snapshot {} does not match subject {}",
                        alert.id, entry.subject_id
                    ),
                });
            }
            if let Some(record) = payload.idempotency {
                state.tokens.insert(
                    record.token,
                    CompletedCommand {
                        fingerprint: record.fingerprint,
                        result: alert.clone(),
                    },
                );
            }
            state.alerts.insert(alert.id.clone(), alert);
        }

        if let Some(responder) = payload.responder {
            if responder.id != entry.subject_id {
                return Err(DispatchError::Replay {
                    sequence: entry.sequence,
                    reason: format!(
                        "responder snapshot {} does not match subject {}",
                        responder.id, entry.subject_id
                    ),
                });
            }
            state.responders.insert(responder.id.clone(), responder);
        }
    }

    Ok(state)
}

/// For alerts still waiting in triage, the alert version at which the last
/// `DISPATCH_NO_CANDIDATE` was recorded.
pub fn no_candidate_versions(entries: &[AuditEntry]) -> Result<BTreeMap<String, u64>> {
    let mut versions: BTreeMap<String, u64> = BTreeMap::new();
    let mut logged = BTreeMap::new();

    for entry in entries {
        if entry.action == AuditAction::DispatchNoCandidate {
            if let Some(version) = versions.get(&entry.subject_id) {
                logged.insert(entry.subject_id.clone(), *version);
            }
            continue;
        }

        let payload: AuditPayload =
            serde_json::from_value(entry.payload.clone()).map_err(|e| DispatchError::Replay {
                sequence: entry.sequence,
                reason: e.to_string(),
            })?;
        if let Some(alert) = payload.alert {
            if alert.status != AlertStatus::Triaged {
                logged.remove(&alert.id);
            }
            versions.insert(alert.id, alert.version);
        }
    }

    Ok(logged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle;
    use crate::types::{AlertKind, NewAlert};
    use chrono::Utc;
    use ledger::{AuditAction, AuditEntry, PendingEntry, GENESIS_HASH};
    use serde_json::json;

    fn seal(sequence: u64, previous: &str, subject: &str, action: AuditAction, payload: &AuditPayload) -> AuditEntry {
        AuditEntry::seal(
            sequence,
            Utc::now(),
            PendingEntry::new(
                "dispatcher-1",
                action,
                subject,
                serde_json::to_value(payload).unwrap(),
            ),
            previous,
        )
    }

    #[test]
    fn test_last_snapshot_wins() {
        let now = Utc::now();
        let reported = lifecycle::report(
            "alert-1".to_string(),
            NewAlert::new(AlertKind::Medical, "reporter-1"),
            now,
        )
        .unwrap();
        let cancelled = lifecycle::cancel(&reported, "false alarm", now).unwrap();

        let first = seal(0, GENESIS_HASH, "alert-1", AuditAction::AlertCreated, &AuditPayload::alert(&reported));
        let second = seal(
            1,
            &first.entry_hash,
            "alert-1",
            AuditAction::AlertCancelled,
            &AuditPayload::alert(&cancelled).with_idempotency("tok-1", "cancel|alert-1"),
        );
        let observation = seal(
            2,
            &second.entry_hash,
            "alert-1",
            AuditAction::DispatchNoCandidate,
            &AuditPayload::observation(json!({"tried": 0})),
        );

        let state = rebuild(&[first, second, observation]).unwrap();
        assert_eq!(state.alerts.len(), 1);
        assert_eq!(state.alerts["alert-1"], cancelled);
        assert_eq!(state.tokens["tok-1"].result, cancelled);
        assert!(state.responders.is_empty());
    }

    #[test]
    fn test_mismatched_subject_rejected() {
        let alert = lifecycle::report(
            "alert-1".to_string(),
            NewAlert::new(AlertKind::Medical, "reporter-1"),
            Utc::now(),
        )
        .unwrap();
        let entry = seal(0, GENESIS_HASH, "alert-9", AuditAction::AlertCreated, &AuditPayload::alert(&alert));

        assert!(matches!(
            rebuild(&[entry]),
            Err(DispatchError::Replay { sequence: 0, .. })
        ));
    }

    #[test]
    fn test_undecodable_payload_rejected() {
        let entry = AuditEntry::seal(
            0,
            Utc::now(),
            PendingEntry::new("x", AuditAction::AlertCreated, "alert-1", json!({"alert": 5})),
            GENESIS_HASH,
        );
        assert!(rebuild(&[entry]).is_err());
    }

    #[test]
    fn test_no_candidate_versions_track_waiting_alerts() {
        let now = Utc::now();
        let report = |id: &str| {
            lifecycle::report(id.to_string(), NewAlert::new(AlertKind::Medical, "reporter-1"), now).unwrap()
        };
        let waiting = lifecycle::triage(&report("alert-1"), None, now).unwrap();
        let assigned_from = lifecycle::triage(&report("alert-2"), None, now).unwrap();
        let assigned = lifecycle::assign(&assigned_from, "responder-1", now).unwrap();

        let steps = [
            ("alert-1", AuditAction::AlertTriaged, AuditPayload::alert(&waiting)),
            ("alert-1", AuditAction::DispatchNoCandidate, AuditPayload::observation(json!({"tried": 0}))),
            ("alert-2", AuditAction::AlertTriaged, AuditPayload::alert(&assigned_from)),
            ("alert-2", AuditAction::DispatchNoCandidate, AuditPayload::observation(json!({"tried": 0}))),
            ("alert-2", AuditAction::AlertAssigned, AuditPayload::alert(&assigned)),
            ("alert-3", AuditAction::DispatchNoCandidate, AuditPayload::observation(json!({"tried": 0}))),
        ];
        let mut entries: Vec<AuditEntry> = Vec::new();
        for (seq, (subject, action, payload)) in steps.iter().enumerate() {
            let previous = entries
                .last()
                .map(|e| e.entry_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            entries.push(seal(seq as u64, &previous, subject, *action, payload));
        }

        let logged = no_candidate_versions(&entries).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged["alert-1"], waiting.version);
    }
}
