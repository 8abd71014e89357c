//! Responder registry.
//!
//! The registry owns the materialized responder table. Mutations are staged
//! as snapshots by the functions at the bottom of this module and applied by
//! the engine once their audit entries commit.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{DispatchError, Result};
use crate::types::{
    AlertKind, Availability, Coordinate, NewResponder, Responder, ResponderStatus,
};

/// A responder eligible for an alert, in dispatch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub responder_id: String,
    /// Straight-line distance; `None` when the alert has no location
    pub distance_m: Option<f64>,
    pub last_dispatched_at: Option<DateTime<Utc>>,
}

/// Materialized responder table.
#[derive(Debug, Default)]
pub struct ResponderRegistry {
    responders: DashMap<String, Responder>,
}

impl ResponderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Responder> {
        self.responders.get(id).map(|r| r.clone())
    }

    /// Responder or `ResponderNotFound`.
    pub fn require(&self, id: &str) -> Result<Responder> {
        self.get(id)
            .ok_or_else(|| DispatchError::ResponderNotFound(id.to_string()))
    }

    /// All responders ordered by id.
    pub fn list(&self) -> Vec<Responder> {
        let mut all: Vec<Responder> = self.responders.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.responders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }

    /// Install a committed snapshot.
    pub fn apply(&self, responder: Responder) {
        self.responders.insert(responder.id.clone(), responder);
    }

    /// Available responders able to handle `kind`, nearest first.
    ///
    /// With no `location` the radius filter is skipped and ordering falls
    /// back to least-recently-dispatched, then id.
    pub fn find_candidates(
        &self,
        kind: AlertKind,
        location: Option<&Coordinate>,
        radius_m: Option<f64>,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .responders
            .iter()
            .filter(|r| r.status == ResponderStatus::Available && r.can_handle(kind))
            .filter_map(|r| {
                let distance_m = location.map(|loc| loc.distance_m(&r.location));
                if let (Some(d), Some(max)) = (distance_m, radius_m) {
                    if d > max {
                        return None;
                    }
                }
                Some(Candidate {
                    responder_id: r.id.clone(),
                    distance_m,
                    last_dispatched_at: r.last_dispatched_at,
                })
            })
            .collect();

        candidates.sort_by(dispatch_order);
        candidates
    }
}

fn dispatch_order(a: &Candidate, b: &Candidate) -> Ordering {
    let by_distance = match (a.distance_m, b.distance_m) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => Ordering::Equal,
    };
    // None sorts first: never-dispatched responders go before anyone else
    by_distance
        .then_with(|| a.last_dispatched_at.cmp(&b.last_dispatched_at))
        .then_with(|| a.responder_id.cmp(&b.responder_id))
}

/// Roster upsert. A known responder keeps its status and current alert.
pub fn register(existing: Option<&Responder>, input: NewResponder) -> Result<Responder> {
    if input.id.trim().is_empty() {
        return Err(DispatchError::InvalidRequest(
            "responder id must not be empty".to_string(),
        ));
    }
    if !input.location.is_valid() {
        return Err(DispatchError::InvalidRequest(format!(
            "responder {} location out of range",
            input.id
        )));
    }

    Ok(match existing {
        Some(current) => Responder {
            display_name: input.display_name,
            capabilities: input.capabilities,
            location: input.location,
            ..current.clone()
        },
        None => Responder {
            id: input.id,
            display_name: input.display_name,
            capabilities: input.capabilities,
            status: match input.availability {
                Availability::Available => ResponderStatus::Available,
                Availability::OffDuty => ResponderStatus::OffDuty,
            },
            location: input.location,
            current_alert: None,
            last_dispatched_at: None,
        },
    })
}

/// `off_duty -> available`.
pub fn mark_available(responder: &Responder) -> Result<Responder> {
    match responder.status {
        ResponderStatus::OffDuty => Ok(Responder {
            status: ResponderStatus::Available,
            ..responder.clone()
        }),
        ResponderStatus::Available => Ok(responder.clone()),
        ResponderStatus::Dispatched => Err(DispatchError::InvalidRequest(format!(
            "responder {} is dispatched; release it through its alert",
            responder.id
        ))),
    }
}

/// `available -> dispatched` to `alert_id`.
pub fn mark_dispatched(
    responder: &Responder,
    alert_id: &str,
    now: DateTime<Utc>,
) -> Result<Responder> {
    if responder.status != ResponderStatus::Available {
        return Err(DispatchError::ResponderUnavailable(responder.id.clone()));
    }
    Ok(Responder {
        status: ResponderStatus::Dispatched,
        current_alert: Some(alert_id.to_string()),
        last_dispatched_at: Some(now),
        ..responder.clone()
    })
}

/// `dispatched -> available`, only from the alert it is dispatched to.
pub fn release(responder: &Responder, alert_id: &str) -> Result<Responder> {
    if responder.current_alert.as_deref() != Some(alert_id) {
        return Err(DispatchError::InvalidRequest(format!(
            "responder {} is not dispatched to alert {}",
            responder.id, alert_id
        )));
    }
    Ok(Responder {
        status: ResponderStatus::Available,
        current_alert: None,
        ..responder.clone()
    })
}

/// Any status to `off_duty`, dropping the current alert.
pub fn mark_off_duty(responder: &Responder) -> Responder {
    Responder {
        status: ResponderStatus::OffDuty,
        current_alert: None,
        ..responder.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn responder(id: &str, lat: f64, lon: f64, kinds: &[AlertKind]) -> Responder {
        register(
            None,
            NewResponder::new(id, id, kinds.iter().copied(), Coordinate::new(lat, lon)),
        )
        .unwrap()
    }

    #[test]
    fn test_candidates_filter_and_order() {
        let registry = ResponderRegistry::new();
        registry.apply(responder("far", 0.0, 0.05, &[AlertKind::Medical]));
        registry.apply(responder("near", 0.0, 0.01, &[AlertKind::Medical]));
        registry.apply(responder("security-only", 0.0, 0.0, &[AlertKind::Security]));
        registry.apply(responder("out-of-range", 0.0, 1.0, &[AlertKind::Medical]));
        registry.apply(mark_off_duty(&responder("resting", 0.0, 0.0, &[AlertKind::Medical])));

        let origin = Coordinate::new(0.0, 0.0);
        let ids: Vec<String> = registry
            .find_candidates(AlertKind::Medical, Some(&origin), Some(10_000.0))
            .into_iter()
            .map(|c| c.responder_id)
            .collect();
        assert_eq!(ids, vec!["near", "far"]);

        // Unbounded radius includes the distant responder last
        let unbounded = registry.find_candidates(AlertKind::Medical, Some(&origin), None);
        assert_eq!(unbounded.last().unwrap().responder_id, "out-of-range");
    }

    #[test]
    fn test_fairness_tiebreak() {
        let registry = ResponderRegistry::new();
        let now = Utc::now();

        let mut recent = responder("a-recent", 0.0, 0.0, &[AlertKind::Hazard]);
        recent.last_dispatched_at = Some(now);
        let mut earlier = responder("b-earlier", 0.0, 0.0, &[AlertKind::Hazard]);
        earlier.last_dispatched_at = Some(now - Duration::minutes(30));
        let never = responder("c-never", 0.0, 0.0, &[AlertKind::Hazard]);

        registry.apply(recent);
        registry.apply(earlier);
        registry.apply(never);

        let ids: Vec<String> = registry
            .find_candidates(AlertKind::Hazard, Some(&Coordinate::new(0.0, 0.0)), None)
            .into_iter()
            .map(|c| c.responder_id)
            .collect();
        assert_eq!(ids, vec!["c-never", "b-earlier", "a-recent"]);
    }

    #[test]
    fn test_no_location_skips_radius() {
        let registry = ResponderRegistry::new();
        registry.apply(responder("r-2", 10.0, 10.0, &[AlertKind::Other]));
        registry.apply(responder("r-1", -10.0, -10.0, &[AlertKind::Other]));

        let candidates = registry.find_candidates(AlertKind::Other, None, Some(1.0));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].responder_id, "r-1");
        assert!(candidates[0].distance_m.is_none());
    }

    #[test]
    fn test_dispatch_and_release() {
        let r = responder("r-1", 0.0, 0.0, &[AlertKind::Medical]);
        let dispatched = mark_dispatched(&r, "alert-1", Utc::now()).unwrap();
        assert_eq!(dispatched.status, ResponderStatus::Dispatched);
        assert_eq!(dispatched.current_alert.as_deref(), Some("alert-1"));

        assert!(matches!(
            mark_dispatched(&dispatched, "alert-2", Utc::now()),
            Err(DispatchError::ResponderUnavailable(_))
        ));
        assert!(release(&dispatched, "alert-2").is_err());

        let released = release(&dispatched, "alert-1").unwrap();
        assert_eq!(released.status, ResponderStatus::Available);
        assert!(released.current_alert.is_none());
        assert!(released.last_dispatched_at.is_some());
    }

    #[test]
    fn test_register_upsert_keeps_dispatch() {
        let r = responder("r-1", 0.0, 0.0, &[AlertKind::Medical]);
        let dispatched = mark_dispatched(&r, "alert-1", Utc::now()).unwrap();

        let update = NewResponder::new(
            "r-1",
            "Medic One",
            [AlertKind::Medical, AlertKind::Hazard],
            Coordinate::new(1.0, 1.0),
        )
        .off_duty();
        let updated = register(Some(&dispatched), update).unwrap();

        assert_eq!(updated.status, ResponderStatus::Dispatched);
        assert_eq!(updated.current_alert.as_deref(), Some("alert-1"));
        assert_eq!(updated.display_name, "Medic One");
        assert!(updated.can_handle(AlertKind::Hazard));
    }

    #[test]
    fn test_availability_changes() {
        let off = mark_off_duty(&responder("r-1", 0.0, 0.0, &[AlertKind::Medical]));
        assert_eq!(mark_available(&off).unwrap().status, ResponderStatus::Available);

        let dispatched = mark_dispatched(
            &responder("r-2", 0.0, 0.0, &[AlertKind::Medical]),
            "alert-1",
            Utc::now(),
        )
        .unwrap();
        assert!(mark_available(&dispatched).is_err());
    }
}
