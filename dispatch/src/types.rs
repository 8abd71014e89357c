//! Core types for the dispatch engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Mean Earth radius in metres (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Finite and within latitude/longitude bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in metres (haversine).
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        // Rounding can push `a` just past 1 for antipodal points
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// What kind of emergency an alert describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Medical,
    Security,
    LostPerson,
    Hazard,
    Other,
}

impl AlertKind {
    /// Priority used when the reporter does not declare one.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Medical | Self::Security => Priority::High,
            Self::LostPerson | Self::Hazard => Priority::Medium,
            Self::Other => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Medical => "medical",
            Self::Security => "security",
            Self::LostPerson => "lost_person",
            Self::Hazard => "hazard",
            Self::Other => "other",
        }
    }
}

/// Alert priority. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// One level up, capped at critical.
    pub fn escalated(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Raise to at least `floor`; never lowers.
    pub fn at_least(self, floor: Priority) -> Self {
        self.max(floor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Zone risk classification. Ordered from safest to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Safe,
    Caution,
    Danger,
}

impl RiskTier {
    /// Lowest priority an alert raised inside this tier may carry.
    pub fn priority_floor(&self) -> Option<Priority> {
        match self {
            Self::Safe => None,
            Self::Caution => Some(Priority::Medium),
            Self::Danger => Some(Priority::High),
        }
    }
}

/// Alert lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Reported,
    Triaged,
    Assigned,
    Responding,
    Resolved,
    Cancelled,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::Triaged => "triaged",
            Self::Assigned => "assigned",
            Self::Responding => "responding",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }

    /// Whether a responder must be attached in this status.
    pub fn holds_responder(&self) -> bool {
        matches!(self, Self::Assigned | Self::Responding)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked emergency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Time-ordered unique ID (UUIDv7)
    pub id: String,
    pub kind: AlertKind,
    pub priority: Priority,
    pub location: Option<Coordinate>,
    pub description: String,
    /// Identity of whoever raised the alert
    pub reporter_id: String,
    pub status: AlertStatus,
    /// Set iff status is assigned or responding
    pub assigned_responder: Option<String>,
    /// Risk tier attached at triage when a location is known
    pub risk_tier: Option<RiskTier>,
    /// Zone that determined `risk_tier`
    pub zone_id: Option<String>,
    pub resolution_note: Option<String>,
    pub cancellation_reason: Option<String>,
    pub archived: bool,
    /// Bumped on every status transition
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// Last priority escalation, if any
    pub escalated_at: Option<DateTime<Utc>>,
}

/// Input for creating an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    pub kind: AlertKind,
    #[serde(default)]
    pub location: Option<Coordinate>,
    #[serde(default)]
    pub description: String,
    pub reporter_id: String,
    /// Declared priority; the kind's default when absent
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl NewAlert {
    pub fn new(kind: AlertKind, reporter_id: impl Into<String>) -> Self {
        Self {
            kind,
            location: None,
            description: String::new(),
            reporter_id: reporter_id.into(),
            priority: None,
        }
    }

    pub fn at(mut self, location: Coordinate) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Filter for alert listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub include_archived: bool,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        if !self.include_archived && alert.archived {
            return false;
        }
        if let Some(status) = self.status {
            if alert.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if alert.priority != priority {
                return false;
            }
        }
        true
    }
}

/// Responder availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponderStatus {
    Available,
    Dispatched,
    OffDuty,
}

impl ResponderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Dispatched => "dispatched",
            Self::OffDuty => "off_duty",
        }
    }
}

/// Availability a roster sync may set; dispatch is the engine's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    OffDuty,
}

/// Someone who can be sent to an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Responder {
    pub id: String,
    pub display_name: String,
    /// Alert kinds this responder can handle
    pub capabilities: BTreeSet<AlertKind>,
    pub status: ResponderStatus,
    pub location: Coordinate,
    /// Set iff status is dispatched
    pub current_alert: Option<String>,
    /// Used to spread work fairly between equally close responders
    pub last_dispatched_at: Option<DateTime<Utc>>,
}

impl Responder {
    pub fn can_handle(&self, kind: AlertKind) -> bool {
        self.capabilities.contains(&kind)
    }
}

/// Roster entry pushed by the external roster sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResponder {
    pub id: String,
    pub display_name: String,
    pub capabilities: BTreeSet<AlertKind>,
    pub location: Coordinate,
    /// Initial availability for newly registered responders
    #[serde(default = "default_availability")]
    pub availability: Availability,
}

fn default_availability() -> Availability {
    Availability::Available
}

impl NewResponder {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        capabilities: impl IntoIterator<Item = AlertKind>,
        location: Coordinate,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            capabilities: capabilities.into_iter().collect(),
            location,
            availability: Availability::Available,
        }
    }

    pub fn off_duty(mut self) -> Self {
        self.availability = Availability::OffDuty;
        self
    }
}

/// Geometry of a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZoneShape {
    Circle { center: Coordinate, radius_m: f64 },
    Polygon { vertices: Vec<Coordinate> },
}

/// Someone to call about a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub phone: String,
}

/// A geographic region with a risk classification and guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub shape: ZoneShape,
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub emergency_contacts: Vec<EmergencyContact>,
}
