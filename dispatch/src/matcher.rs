//! Dispatch matcher: candidate selection with retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::registry::ResponderRegistry;
use crate::types::{Alert, AlertStatus, Priority};

/// Performs one assignment attempt atomically.
///
/// Implementations must fail with `ResponderUnavailable` when the responder
/// is no longer available and with `InvalidTransition` when the alert has
/// left `triaged`.
#[async_trait]
pub trait Assigner: Send + Sync {
    async fn try_assign(&self, actor_id: &str, alert_id: &str, responder_id: &str)
        -> Result<Alert>;
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Assigned { responder_id: String },
    /// Every candidate was tried (or none existed); the alert stays triaged
    NoCandidate { tried: usize },
    /// The alert is not waiting for dispatch
    NotEligible { status: AlertStatus },
}

/// Selects and assigns responders for triaged alerts.
#[derive(Debug, Clone)]
pub struct DispatchMatcher {
    config: DispatchConfig,
}

impl DispatchMatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    /// Search radius for a priority class; `None` is unbounded.
    pub fn radius_for(&self, priority: Priority) -> Option<f64> {
        self.config.radius_m.for_priority(priority)
    }

    /// Try candidates in order until one assignment commits.
    pub async fn dispatch(
        &self,
        alert: &Alert,
        registry: &ResponderRegistry,
        assigner: &dyn Assigner,
        actor_id: &str,
    ) -> Result<DispatchOutcome> {
        if alert.status != AlertStatus::Triaged {
            return Ok(DispatchOutcome::NotEligible {
                status: alert.status,
            });
        }

        let radius = self.radius_for(alert.priority);
        let candidates = registry.find_candidates(alert.kind, alert.location.as_ref(), radius);
        debug!(
            alert_id = %alert.id,
            candidates = candidates.len(),
            radius_m = ?radius,
            "Dispatch candidates found"
        );

        let mut tried = 0;
        for candidate in candidates {
            tried += 1;
            match assigner
                .try_assign(actor_id, &alert.id, &candidate.responder_id)
                .await
            {
                Ok(_) => {
                    return Ok(DispatchOutcome::Assigned {
                        responder_id: candidate.responder_id,
                    })
                }
                Err(DispatchError::ResponderUnavailable(id)) => {
                    debug!(alert_id = %alert.id, responder_id = %id, "Candidate lost, trying next");
                }
                Err(DispatchError::InvalidTransition { from, .. }) => {
                    return Ok(DispatchOutcome::NotEligible { status: from });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(DispatchOutcome::NoCandidate { tried })
    }
}
