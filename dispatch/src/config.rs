//! Configuration for the dispatch engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::types::{Priority, Zone};

/// Configuration for a dispatch engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Actor ID recorded for automatic transitions
    pub engine_id: String,
    /// Timers and sweep cadence
    pub timing: TimingConfig,
    /// Matching policy
    pub dispatch: DispatchConfig,
    /// Geofence zones
    pub zones: Vec<Zone>,
    /// Capacity of the engine event channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: "dispatch-engine".to_string(),
            timing: TimingConfig::default(),
            dispatch: DispatchConfig::default(),
            zones: Vec::new(),
            event_buffer: 1024,
        }
    }
}

impl EngineConfig {
    /// Create a new config with engine ID.
    pub fn new(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            ..Default::default()
        }
    }

    pub fn with_zones(mut self, zones: Vec<Zone>) -> Self {
        self.zones = zones;
        self
    }

    pub fn with_ack_timeout_secs(mut self, secs: u64) -> Self {
        self.timing.ack_timeout_secs = secs;
        self
    }

    pub fn with_sla_escalation_secs(mut self, secs: u64) -> Self {
        self.timing.sla_escalation_secs = secs;
        self
    }

    pub fn with_auto_dispatch(mut self, enabled: bool) -> Self {
        self.dispatch.auto_dispatch = enabled;
        self
    }

    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine_id.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "engine_id must not be empty".to_string(),
            ));
        }
        if self.timing.ack_timeout_secs == 0 || self.timing.sweep_interval_secs == 0 {
            return Err(DispatchError::InvalidRequest(
                "ack_timeout_secs and sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(DispatchError::InvalidRequest(
                "event_buffer must be positive".to_string(),
            ));
        }
        for (priority, radius) in self.dispatch.radius_m.iter() {
            if let Some(r) = radius {
                if !(r.is_finite() && r > 0.0) {
                    return Err(DispatchError::InvalidRequest(format!(
                        "search radius for {} must be positive",
                        priority.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long an assigned responder has to acknowledge (seconds)
    pub ack_timeout_secs: u64,
    /// Interval between background sweeps (seconds)
    pub sweep_interval_secs: u64,
    /// Time in triage before priority is escalated (seconds)
    pub sla_escalation_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 120,
            sweep_interval_secs: 30,
            sla_escalation_secs: 300, // 5 minutes
        }
    }
}

impl TimingConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sla_escalation(&self) -> Duration {
        Duration::from_secs(self.sla_escalation_secs)
    }
}

/// Matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Dispatch as soon as an alert is triaged
    pub auto_dispatch: bool,
    /// Search radius per priority class
    pub radius_m: SearchRadii,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto_dispatch: true,
            radius_m: SearchRadii::default(),
        }
    }
}

/// Search radius in metres per priority. `None` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRadii {
    pub low: Option<f64>,
    pub medium: Option<f64>,
    pub high: Option<f64>,
    pub critical: Option<f64>,
}

impl Default for SearchRadii {
    fn default() -> Self {
        Self {
            low: Some(5_000.0),
            medium: Some(10_000.0),
            high: Some(25_000.0),
            critical: None,
        }
    }
}

impl SearchRadii {
    pub fn for_priority(&self, priority: Priority) -> Option<f64> {
        match priority {
            Priority::Low => self.low,
            Priority::Medium => self.medium,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (Priority, Option<f64>)> + '_ {
        [
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ]
        .into_iter()
        .map(|p| (p, self.for_priority(p)))
    }
}
