//! Alert lifecycle state machine.
//!
//! ```text
//! reported -> triaged -> assigned -> responding -> resolved
//!                ^           |            |
//!                +-----------+------------+   (ack timeout / forced release)
//!
//! any non-terminal -> cancelled
//! ```
//!
//! Every operation here is pure: it validates against the current snapshot
//! and returns the next one, or a typed error with nothing changed. The
//! engine stages the returned snapshot and applies it only after the audit
//! entry commits.

use chrono::{DateTime, Utc};

use crate::error::{DispatchError, Result};
use crate::types::{Alert, AlertStatus, NewAlert};
use crate::zones::ZoneMatch;

/// Whether `from -> to` is an edge of the lifecycle graph.
pub fn can_transition(from: AlertStatus, to: AlertStatus) -> bool {
    use AlertStatus::*;

    match (from, to) {
        (Reported, Triaged) => true,
        (Triaged, Assigned) => true,
        (Assigned, Responding) => true,
        (Responding, Resolved) => true,
        (Assigned | Responding, Triaged) => true,
        (Reported | Triaged | Assigned | Responding, Cancelled) => true,
        _ => false,
    }
}

fn transition(alert: &Alert, to: AlertStatus, now: DateTime<Utc>) -> Result<Alert> {
    if !can_transition(alert.status, to) {
        return Err(DispatchError::InvalidTransition {
            alert_id: alert.id.clone(),
            from: alert.status,
            to,
        });
    }

    let mut next = alert.clone();
    next.status = to;
    next.version += 1;
    next.last_transition_at = now;
    if !to.holds_responder() {
        next.assigned_responder = None;
    }
    Ok(next)
}

/// A freshly reported alert.
pub fn report(id: String, input: NewAlert, now: DateTime<Utc>) -> Result<Alert> {
    if input.reporter_id.trim().is_empty() {
        return Err(DispatchError::InvalidRequest(
            "reporter_id must not be empty".to_string(),
        ));
    }
    if let Some(location) = &input.location {
        if !location.is_valid() {
            return Err(DispatchError::InvalidRequest(format!(
                "location out of range: ({}, {})",
                location.lat, location.lon
            )));
        }
    }

    Ok(Alert {
        id,
        kind: input.kind,
        priority: input.priority.unwrap_or_else(|| input.kind.default_priority()),
        location: input.location,
        description: input.description,
        reporter_id: input.reporter_id,
        status: AlertStatus::Reported,
        assigned_responder: None,
        risk_tier: None,
        zone_id: None,
        resolution_note: None,
        cancellation_reason: None,
        archived: false,
        version: 0,
        created_at: now,
        last_transition_at: now,
        escalated_at: None,
    })
}

/// `reported -> triaged`, attaching the zone classification.
///
/// Zone risk raises the priority to the tier's floor and never lowers it.
pub fn triage(alert: &Alert, zone: Option<&ZoneMatch>, now: DateTime<Utc>) -> Result<Alert> {
    let mut next = transition(alert, AlertStatus::Triaged, now)?;
    if let Some(zone) = zone {
        next.risk_tier = Some(zone.risk_tier);
        next.zone_id = zone.zone.as_ref().map(|z| z.id.clone());
        if let Some(floor) = zone.risk_tier.priority_floor() {
            next.priority = next.priority.at_least(floor);
        }
    }
    Ok(next)
}

/// `triaged -> assigned`.
pub fn assign(alert: &Alert, responder_id: &str, now: DateTime<Utc>) -> Result<Alert> {
    let mut next = transition(alert, AlertStatus::Assigned, now)?;
    next.assigned_responder = Some(responder_id.to_string());
    Ok(next)
}

/// `assigned -> responding`; only the assigned responder may acknowledge.
pub fn acknowledge(alert: &Alert, responder_id: &str, now: DateTime<Utc>) -> Result<Alert> {
    if alert.status == AlertStatus::Assigned
        && alert.assigned_responder.as_deref() != Some(responder_id)
    {
        return Err(DispatchError::ResponderMismatch {
            alert_id: alert.id.clone(),
            responder_id: responder_id.to_string(),
        });
    }
    transition(alert, AlertStatus::Responding, now)
}

/// `responding -> resolved`, by the responder working the alert.
pub fn resolve(alert: &Alert, responder_id: &str, note: &str, now: DateTime<Utc>) -> Result<Alert> {
    if note.trim().is_empty() {
        return Err(DispatchError::InvalidRequest(
            "resolution note must not be empty".to_string(),
        ));
    }
    if alert.status == AlertStatus::Responding
        && alert.assigned_responder.as_deref() != Some(responder_id)
    {
        return Err(DispatchError::ResponderMismatch {
            alert_id: alert.id.clone(),
            responder_id: responder_id.to_string(),
        });
    }
    let mut next = transition(alert, AlertStatus::Resolved, now)?;
    next.resolution_note = Some(note.to_string());
    Ok(next)
}

/// Any non-terminal status to `cancelled`.
pub fn cancel(alert: &Alert, reason: &str, now: DateTime<Utc>) -> Result<Alert> {
    if reason.trim().is_empty() {
        return Err(DispatchError::InvalidRequest(
            "cancellation reason must not be empty".to_string(),
        ));
    }
    let mut next = transition(alert, AlertStatus::Cancelled, now)?;
    next.cancellation_reason = Some(reason.to_string());
    Ok(next)
}

/// `assigned -> triaged` after the acknowledgment window elapsed.
pub fn time_out(alert: &Alert, now: DateTime<Utc>) -> Result<Alert> {
    if alert.status != AlertStatus::Assigned {
        return Err(DispatchError::InvalidTransition {
            alert_id: alert.id.clone(),
            from: alert.status,
            to: AlertStatus::Triaged,
        });
    }
    transition(alert, AlertStatus::Triaged, now)
}

/// `assigned | responding -> triaged`, forced release of the responder.
pub fn revert(alert: &Alert, now: DateTime<Utc>) -> Result<Alert> {
    if !alert.status.holds_responder() {
        return Err(DispatchError::InvalidTransition {
            alert_id: alert.id.clone(),
            from: alert.status,
            to: AlertStatus::Triaged,
        });
    }
    transition(alert, AlertStatus::Triaged, now)
}

/// Raise priority one level. Status and version are unchanged.
pub fn escalate(alert: &Alert, now: DateTime<Utc>) -> Result<Alert> {
    if alert.status.is_terminal() {
        return Err(DispatchError::InvalidTransition {
            alert_id: alert.id.clone(),
            from: alert.status,
            to: alert.status,
        });
    }
    let mut next = alert.clone();
    next.priority = alert.priority.escalated();
    next.escalated_at = Some(now);
    Ok(next)
}

/// Hide a terminal alert from default listings.
pub fn archive(alert: &Alert) -> Result<Alert> {
    if !alert.status.is_terminal() {
        return Err(DispatchError::InvalidRequest(format!(
            "alert {} is {} and cannot be archived",
            alert.id, alert.status
        )));
    }
    let mut next = alert.clone();
    next.archived = true;
    Ok(next)
}
