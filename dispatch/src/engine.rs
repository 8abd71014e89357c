//! The dispatch engine.
//!
//! Owns the materialized alert and responder tables and runs every command
//! as a unit of work: validate under the entity locks, stage snapshots and
//! audit entries, append the entries in one ledger batch, and only then
//! apply the snapshots and publish events. A failed append leaves every
//! table untouched.
//!
//! Public commands run on their own task. A caller that goes away mid-command
//! (a dropped HTTP request, an elapsed timeout) cannot stop a unit between
//! its ledger append and the table update.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ledger::{AuditAction, AuditEntry, AuditLedger, LedgerError, VerifyReport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DispatchError, Result};
use crate::events::EngineEvent;
use crate::idempotency::{fingerprint, IdempotencyCache, Reservation};
use crate::lifecycle;
use crate::locks::{EntityGuard, LockTable};
use crate::matcher::{Assigner, DispatchMatcher, DispatchOutcome};
use crate::registry::{self, ResponderRegistry};
use crate::replay::{self, AuditPayload, MaterializedState};
use crate::timers::AckTimers;
use crate::types::{
    Alert, AlertFilter, AlertStatus, Availability, Coordinate, NewAlert, NewResponder, Priority,
    Responder, ResponderStatus, Zone,
};
use crate::unit::UnitOfWork;
use crate::zones::{ZoneEvaluator, ZoneMatch};

/// What a sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Assigned alerts whose acknowledgment window had elapsed
    pub timed_out: usize,
    /// Triaged alerts escalated for breaching the SLA
    pub escalated: usize,
    pub assigned: usize,
    pub no_candidate: usize,
    /// Operations that returned an error
    pub failed: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Run `work` on its own task and wait for it.
async fn detached<T, F>(command: &'static str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(work).await.map_err(|e| {
        error!(command, error = %e, "Command task failed");
        DispatchError::Internal(format!("{} did not complete: {}", command, e))
    })?
}

struct EngineInner {
    config: EngineConfig,
    ledger: Arc<AuditLedger>,
    zones: ZoneEvaluator,
    matcher: DispatchMatcher,
    alerts: DashMap<String, Alert>,
    registry: ResponderRegistry,
    alert_locks: LockTable,
    responder_locks: LockTable,
    idempotency: IdempotencyCache,
    timers: AckTimers,
    /// Alert version at which the last no-candidate outcome was recorded
    no_candidate_logged: DashMap<String, u64>,
    events: broadcast::Sender<EngineEvent>,
}

/// Alert dispatch engine. Cheap to clone.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    /// Build an engine over `ledger`, replaying it to restore state.
    ///
    /// Refuses to start on a broken chain. Alerts still awaiting
    /// acknowledgment get their timers re-armed with the remaining time.
    pub async fn new(config: EngineConfig, ledger: Arc<AuditLedger>) -> Result<Self> {
        config.validate()?;
        let zones = ZoneEvaluator::new(config.zones.clone())?;

        let report = ledger.verify_all().await;
        if let Some(seq) = report.broken_at_seq {
            error!(sequence = seq, "Refusing to start on a broken audit chain");
            return Err(DispatchError::LedgerIntegrityViolation(seq));
        }

        let entries = ledger.snapshot().await;
        let state = replay::rebuild(&entries)?;
        let no_candidate = replay::no_candidate_versions(&entries)?;
        let (events, _) = broadcast::channel(config.event_buffer);

        let inner = EngineInner {
            matcher: DispatchMatcher::new(config.dispatch.clone()),
            config,
            ledger,
            zones,
            alerts: DashMap::new(),
            registry: ResponderRegistry::new(),
            alert_locks: LockTable::new("alert"),
            responder_locks: LockTable::new("responder"),
            idempotency: IdempotencyCache::new(),
            timers: AckTimers::new(),
            no_candidate_logged: DashMap::new(),
            events,
        };

        for (id, alert) in state.alerts {
            inner.alerts.insert(id, alert);
        }
        for responder in state.responders.into_values() {
            inner.registry.apply(responder);
        }
        for (token, command) in state.tokens {
            inner.idempotency.restore(token, command);
        }
        for (id, version) in no_candidate {
            inner.no_candidate_logged.insert(id, version);
        }

        let engine = Self {
            inner: Arc::new(inner),
        };
        let rearmed = engine.rearm_timers();

        info!(
            engine_id = %engine.inner.config.engine_id,
            alerts = engine.inner.alerts.len(),
            responders = engine.inner.registry.len(),
            zones = engine.inner.zones.len(),
            timers = rearmed,
            "Dispatch engine started"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.inner.ledger
    }

    /// Subscribe to committed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    fn system_actor(&self) -> &str {
        &self.inner.config.engine_id
    }

    /// Abort every acknowledgment timer. Call before handing the ledger to
    /// another engine instance.
    pub fn shutdown(&self) {
        let aborted = self.inner.timers.cancel_all();
        info!(engine_id = %self.inner.config.engine_id, timers = aborted, "Dispatch engine stopped");
    }

    // =========================================================================
    // Commit path
    // =========================================================================

    async fn commit(&self, unit: UnitOfWork) -> Result<Vec<AuditEntry>> {
        let (pending, snapshots): (Vec<_>, Vec<_>) = unit
            .into_changes()
            .into_iter()
            .map(|c| (c.entry, (c.alert, c.responder)))
            .unzip();

        let entries = self
            .inner
            .ledger
            .append_batch(pending)
            .await
            .map_err(|e| {
                error!(error = %e, "Ledger append failed, unit of work rolled back");
                DispatchError::LedgerAppendFailed(e)
            })?;

        for (alert, responder) in &snapshots {
            if let Some(alert) = alert {
                if alert.status != AlertStatus::Triaged {
                    self.inner.no_candidate_logged.remove(&alert.id);
                }
                self.inner.alerts.insert(alert.id.clone(), alert.clone());
            }
            if let Some(responder) = responder {
                self.inner.registry.apply(responder.clone());
            }
        }

        for (entry, (alert, responder)) in entries.iter().zip(snapshots) {
            // No subscribers is fine
            let _ = self.inner.events.send(EngineEvent {
                sequence: entry.sequence,
                timestamp: entry.timestamp,
                action: entry.action,
                actor_id: entry.actor_id.clone(),
                subject_id: entry.subject_id.clone(),
                alert,
                responder,
            });
        }

        Ok(entries)
    }

    fn alert(&self, alert_id: &str) -> Result<Alert> {
        self.inner
            .alerts
            .get(alert_id)
            .map(|a| a.clone())
            .ok_or_else(|| DispatchError::AlertNotFound(alert_id.to_string()))
    }

    /// Lock the responder and stage its release from `alert_id`.
    async fn stage_release(
        &self,
        unit: &mut UnitOfWork,
        actor_id: &str,
        responder_id: &str,
        alert_id: &str,
    ) -> Result<EntityGuard> {
        let guard = self.inner.responder_locks.lock(responder_id).await;
        let responder = self.inner.registry.require(responder_id)?;
        let released = registry::release(&responder, alert_id)?;
        unit.responder(
            actor_id,
            AuditAction::ResponderReleased,
            &released,
            Some(json!({ "alert_id": alert_id })),
        )?;
        Ok(guard)
    }

    // =========================================================================
    // Alert commands
    // =========================================================================

    /// Report, classify and triage a new alert, then dispatch it if enabled.
    pub async fn create_alert(&self, input: NewAlert) -> Result<Alert> {
        let engine = self.clone();
        detached("create_alert", async move { engine.create_alert_now(input).await }).await
    }

    async fn create_alert_now(&self, input: NewAlert) -> Result<Alert> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();

        let reported = lifecycle::report(id.clone(), input, now)?;
        let zone = reported
            .location
            .as_ref()
            .map(|loc| self.inner.zones.evaluate(loc));
        let triaged = lifecycle::triage(&reported, zone.as_ref(), now)?;

        {
            let _guard = self.inner.alert_locks.lock(&id).await;
            let mut unit = UnitOfWork::new();
            unit.alert(
                &reported.reporter_id,
                AuditAction::AlertCreated,
                &reported,
                None,
            )?;
            unit.alert(
                self.system_actor(),
                AuditAction::AlertTriaged,
                &triaged,
                Some(json!({
                    "declared_priority": reported.priority,
                    "risk_tier": triaged.risk_tier,
                    "zone_id": triaged.zone_id,
                })),
            )?;
            self.commit(unit).await?;
        }

        info!(
            alert_id = %id,
            kind = triaged.kind.as_str(),
            priority = triaged.priority.as_str(),
            risk_tier = ?triaged.risk_tier,
            "Alert created and triaged"
        );

        if self.inner.config.dispatch.auto_dispatch {
            if let Err(e) = self.dispatch_now(&id, self.system_actor()).await {
                warn!(alert_id = %id, error = %e, "Automatic dispatch failed; sweep will retry");
            }
        }

        self.alert(&id)
    }

    /// `assigned -> responding` by the assigned responder.
    pub async fn acknowledge(
        &self,
        alert_id: &str,
        responder_id: &str,
        idempotency_token: &str,
    ) -> Result<Alert> {
        let engine = self.clone();
        let alert_id = alert_id.to_string();
        let responder_id = responder_id.to_string();
        let token = idempotency_token.to_string();
        detached("acknowledge", async move {
            engine.acknowledge_now(&alert_id, &responder_id, &token).await
        })
        .await
    }

    async fn acknowledge_now(&self, alert_id: &str, responder_id: &str, token: &str) -> Result<Alert> {
        let fp = fingerprint("acknowledge", alert_id, &[responder_id]);
        let _guard = self.inner.alert_locks.lock(alert_id).await;

        let claim = match self.inner.idempotency.reserve(token, &fp)? {
            Reservation::Replay(prior) => {
                debug!(alert_id, token, "Replaying acknowledgment");
                return Ok(prior);
            }
            Reservation::Fresh(claim) => claim,
        };
        let outcome = self.acknowledge_locked(alert_id, responder_id, token, &fp).await;
        claim.settle(&outcome);
        outcome
    }

    async fn acknowledge_locked(
        &self,
        alert_id: &str,
        responder_id: &str,
        token: &str,
        fp: &str,
    ) -> Result<Alert> {
        let alert = self.alert(alert_id)?;
        let next = lifecycle::acknowledge(&alert, responder_id, Utc::now())?;

        let mut unit = UnitOfWork::new();
        unit.record(
            responder_id,
            AuditAction::AlertAcknowledged,
            alert_id,
            AuditPayload::alert(&next).with_idempotency(token, fp),
        )?;
        self.commit(unit).await?;
        self.inner.timers.cancel(alert_id);

        info!(alert_id, responder_id, "Alert acknowledged");
        Ok(next)
    }

    /// `responding -> resolved`, releasing the responder.
    pub async fn resolve(
        &self,
        alert_id: &str,
        note: &str,
        idempotency_token: &str,
        actor_id: &str,
    ) -> Result<Alert> {
        let engine = self.clone();
        let (alert_id, note) = (alert_id.to_string(), note.to_string());
        let (token, actor_id) = (idempotency_token.to_string(), actor_id.to_string());
        detached("resolve", async move {
            engine
                .close(&alert_id, Closing::Resolve(&note), &actor_id, &token)
                .await
        })
        .await
    }

    /// Any non-terminal status to `cancelled`, releasing any responder.
    pub async fn cancel(
        &self,
        alert_id: &str,
        reason: &str,
        idempotency_token: &str,
        actor_id: &str,
    ) -> Result<Alert> {
        let engine = self.clone();
        let (alert_id, reason) = (alert_id.to_string(), reason.to_string());
        let (token, actor_id) = (idempotency_token.to_string(), actor_id.to_string());
        detached("cancel", async move {
            engine
                .close(&alert_id, Closing::Cancel(&reason), &actor_id, &token)
                .await
        })
        .await
    }

    /// Shared token handling for resolve and cancel.
    async fn close(
        &self,
        alert_id: &str,
        closing: Closing<'_>,
        actor_id: &str,
        token: &str,
    ) -> Result<Alert> {
        let fp = match closing {
            Closing::Resolve(note) => fingerprint("resolve", alert_id, &[note]),
            Closing::Cancel(reason) => fingerprint("cancel", alert_id, &[reason]),
        };
        let _guard = self.inner.alert_locks.lock(alert_id).await;

        let claim = match self.inner.idempotency.reserve(token, &fp)? {
            Reservation::Replay(prior) => {
                debug!(alert_id, token, "Replaying closing command");
                return Ok(prior);
            }
            Reservation::Fresh(claim) => claim,
        };
        let outcome = self.close_locked(alert_id, closing, actor_id, token, &fp).await;
        claim.settle(&outcome);
        outcome
    }

    async fn close_locked(
        &self,
        alert_id: &str,
        closing: Closing<'_>,
        actor_id: &str,
        token: &str,
        fp: &str,
    ) -> Result<Alert> {
        let alert = self.alert(alert_id)?;
        let now = Utc::now();
        let (next, action, detail) = match closing {
            Closing::Resolve(note) => (
                lifecycle::resolve(&alert, actor_id, note, now)?,
                AuditAction::AlertResolved,
                json!({ "note": note }),
            ),
            Closing::Cancel(reason) => (
                lifecycle::cancel(&alert, reason, now)?,
                AuditAction::AlertCancelled,
                json!({ "reason": reason, "previous_status": alert.status }),
            ),
        };

        let mut unit = UnitOfWork::new();
        unit.record(
            actor_id,
            action,
            alert_id,
            AuditPayload::alert(&next)
                .with_detail(detail)
                .with_idempotency(token, fp),
        )?;

        let _responder_guard = match alert.assigned_responder.as_deref() {
            Some(responder_id) => Some(
                self.stage_release(&mut unit, actor_id, responder_id, alert_id)
                    .await?,
            ),
            None => None,
        };

        self.commit(unit).await?;
        self.inner.timers.cancel(alert_id);

        info!(
            alert_id,
            status = next.status.as_str(),
            responder_id = ?alert.assigned_responder,
            "Alert closed"
        );
        Ok(next)
    }

    /// Raise priority one level.
    pub async fn escalate(&self, alert_id: &str, reason: &str, actor_id: &str) -> Result<Alert> {
        let engine = self.clone();
        let (alert_id, reason) = (alert_id.to_string(), reason.to_string());
        let actor_id = actor_id.to_string();
        detached("escalate", async move {
            engine.escalate_now(&alert_id, &reason, &actor_id).await
        })
        .await
    }

    async fn escalate_now(&self, alert_id: &str, reason: &str, actor_id: &str) -> Result<Alert> {
        if reason.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "escalation reason must not be empty".to_string(),
            ));
        }

        let _guard = self.inner.alert_locks.lock(alert_id).await;
        let alert = self.alert(alert_id)?;
        let next = lifecycle::escalate(&alert, Utc::now())?;

        let mut unit = UnitOfWork::new();
        unit.alert(
            actor_id,
            AuditAction::AlertEscalated,
            &next,
            Some(json!({
                "reason": reason,
                "from": alert.priority,
                "to": next.priority,
            })),
        )?;
        self.commit(unit).await?;

        warn!(
            alert_id,
            from = alert.priority.as_str(),
            to = next.priority.as_str(),
            reason,
            "Alert escalated"
        );
        Ok(next)
    }

    /// Hide a terminal alert from default listings.
    pub async fn archive(&self, alert_id: &str, actor_id: &str) -> Result<Alert> {
        let engine = self.clone();
        let (alert_id, actor_id) = (alert_id.to_string(), actor_id.to_string());
        detached("archive", async move { engine.archive_now(&alert_id, &actor_id).await }).await
    }

    async fn archive_now(&self, alert_id: &str, actor_id: &str) -> Result<Alert> {
        let _guard = self.inner.alert_locks.lock(alert_id).await;
        let alert = self.alert(alert_id)?;
        if alert.archived {
            return Ok(alert);
        }
        let next = lifecycle::archive(&alert)?;

        let mut unit = UnitOfWork::new();
        unit.alert(actor_id, AuditAction::AlertArchived, &next, None)?;
        self.commit(unit).await?;

        info!(alert_id, "Alert archived");
        Ok(next)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Try to assign a responder to a triaged alert.
    pub async fn dispatch(&self, alert_id: &str, actor_id: &str) -> Result<DispatchOutcome> {
        let engine = self.clone();
        let (alert_id, actor_id) = (alert_id.to_string(), actor_id.to_string());
        detached("dispatch", async move { engine.dispatch_now(&alert_id, &actor_id).await }).await
    }

    async fn dispatch_now(&self, alert_id: &str, actor_id: &str) -> Result<DispatchOutcome> {
        let alert = self.alert(alert_id)?;
        let outcome = self
            .inner
            .matcher
            .dispatch(&alert, &self.inner.registry, self, actor_id)
            .await?;

        match &outcome {
            DispatchOutcome::Assigned { responder_id } => {
                debug!(alert_id, responder_id = %responder_id, "Dispatch succeeded");
            }
            DispatchOutcome::NoCandidate { tried } => {
                warn!(
                    alert_id,
                    tried,
                    priority = alert.priority.as_str(),
                    "No responder available for alert"
                );
                self.record_no_candidate(alert_id, *tried, actor_id).await?;
            }
            DispatchOutcome::NotEligible { status } => {
                debug!(alert_id, status = status.as_str(), "Alert not eligible for dispatch");
            }
        }
        Ok(outcome)
    }

    /// Log a no-candidate outcome once per alert version.
    async fn record_no_candidate(&self, alert_id: &str, tried: usize, actor_id: &str) -> Result<()> {
        let _guard = self.inner.alert_locks.lock(alert_id).await;
        let alert = self.alert(alert_id)?;
        if alert.status != AlertStatus::Triaged {
            return Ok(());
        }
        let already = self
            .inner
            .no_candidate_logged
            .get(alert_id)
            .map(|v| *v == alert.version)
            .unwrap_or(false);
        if already {
            return Ok(());
        }

        let mut unit = UnitOfWork::new();
        unit.record(
            actor_id,
            AuditAction::DispatchNoCandidate,
            alert_id,
            AuditPayload::observation(json!({
                "tried": tried,
                "priority": alert.priority,
                "radius_m": self.inner.matcher.radius_for(alert.priority),
            })),
        )?;
        self.commit(unit).await?;
        self.inner
            .no_candidate_logged
            .insert(alert_id.to_string(), alert.version);
        Ok(())
    }

    /// One assignment attempt under both entity locks.
    async fn assign_locked(&self, actor_id: &str, alert_id: &str, responder_id: &str) -> Result<Alert> {
        let _alert_guard = self.inner.alert_locks.lock(alert_id).await;
        let alert = self.alert(alert_id)?;
        let now = Utc::now();
        let next = lifecycle::assign(&alert, responder_id, now)?;

        let _responder_guard = self.inner.responder_locks.lock(responder_id).await;
        let responder = self.inner.registry.require(responder_id)?;
        let dispatched = registry::mark_dispatched(&responder, alert_id, now)?;

        let mut unit = UnitOfWork::new();
        unit.alert(
            actor_id,
            AuditAction::AlertAssigned,
            &next,
            Some(json!({ "responder_id": responder_id })),
        )?;
        unit.responder(
            actor_id,
            AuditAction::ResponderDispatched,
            &dispatched,
            Some(json!({ "alert_id": alert_id })),
        )?;
        self.commit(unit).await?;

        self.arm_timer(alert_id, next.version, self.inner.config.timing.ack_timeout());
        info!(alert_id, responder_id, "Responder assigned");
        Ok(next)
    }

    // =========================================================================
    // Acknowledgment timers
    // =========================================================================

    fn arm_timer(&self, alert_id: &str, version: u64, after: Duration) {
        let engine = self.clone();
        let id = alert_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            engine.inner.timers.disarm(&id, version);
            if let Err(e) = engine.expire_assignment(&id, version).await {
                error!(alert_id = %id, error = %e, "Acknowledgment timeout failed; sweep will retry");
            }
        });
        self.inner
            .timers
            .arm(alert_id, version, task.abort_handle());
    }

    fn rearm_timers(&self) -> usize {
        let timeout = self.inner.config.timing.ack_timeout();
        let now = Utc::now();
        let waiting: Vec<(String, u64, Duration)> = self
            .inner
            .alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Assigned)
            .map(|a| {
                let elapsed = (now - a.last_transition_at).to_std().unwrap_or(Duration::ZERO);
                (a.id.clone(), a.version, timeout.saturating_sub(elapsed))
            })
            .collect();

        for (id, version, remaining) in &waiting {
            debug!(alert_id = %id, remaining_secs = remaining.as_secs(), "Re-arming acknowledgment timer");
            self.arm_timer(id, *version, *remaining);
        }
        waiting.len()
    }

    /// Return an unacknowledged assignment to triage. Stale versions no-op.
    async fn expire_assignment(&self, alert_id: &str, version: u64) -> Result<bool> {
        let _guard = self.inner.alert_locks.lock(alert_id).await;
        let alert = match self.inner.alerts.get(alert_id).map(|a| a.clone()) {
            Some(alert) => alert,
            None => return Ok(false),
        };
        if alert.status != AlertStatus::Assigned || alert.version != version {
            debug!(alert_id, version, current = alert.version, "Stale acknowledgment timer");
            return Ok(false);
        }

        let actor = self.system_actor();
        let next = lifecycle::time_out(&alert, Utc::now())?;
        let mut unit = UnitOfWork::new();
        unit.alert(
            actor,
            AuditAction::AlertAckTimeout,
            &next,
            Some(json!({
                "responder_id": alert.assigned_responder,
                "timeout_secs": self.inner.config.timing.ack_timeout_secs,
            })),
        )?;
        let _responder_guard = match alert.assigned_responder.as_deref() {
            Some(responder_id) => {
                Some(self.stage_release(&mut unit, actor, responder_id, alert_id).await?)
            }
            None => None,
        };
        self.commit(unit).await?;

        warn!(
            alert_id,
            responder_id = ?alert.assigned_responder,
            "Acknowledgment timed out; alert returned to triage"
        );
        Ok(true)
    }

    /// Whether an acknowledgment timer is armed for the alert.
    pub fn has_ack_timer(&self, alert_id: &str) -> bool {
        self.inner.timers.is_armed(alert_id)
    }

    // =========================================================================
    // Responder commands
    // =========================================================================

    /// Roster upsert.
    pub async fn register_responder(&self, input: NewResponder, actor_id: &str) -> Result<Responder> {
        let engine = self.clone();
        let actor_id = actor_id.to_string();
        detached("register_responder", async move {
            engine.register_responder_now(input, &actor_id).await
        })
        .await
    }

    async fn register_responder_now(&self, input: NewResponder, actor_id: &str) -> Result<Responder> {
        let id = input.id.clone();
        let _guard = self.inner.responder_locks.lock(&id).await;
        let existing = self.inner.registry.get(&id);
        let next = registry::register(existing.as_ref(), input)?;

        if existing.as_ref() == Some(&next) {
            return Ok(next);
        }

        let mut unit = UnitOfWork::new();
        unit.responder(
            actor_id,
            AuditAction::ResponderRegistered,
            &next,
            Some(json!({ "created": existing.is_none() })),
        )?;
        self.commit(unit).await?;

        info!(
            responder_id = %id,
            status = next.status.as_str(),
            capabilities = next.capabilities.len(),
            "Responder registered"
        );
        Ok(next)
    }

    /// Roster availability change.
    ///
    /// Going off duty while dispatched forces the alert back to triage and
    /// re-dispatches it.
    pub async fn set_responder_availability(
        &self,
        responder_id: &str,
        availability: Availability,
        actor_id: &str,
    ) -> Result<Responder> {
        let engine = self.clone();
        let (responder_id, actor_id) = (responder_id.to_string(), actor_id.to_string());
        detached("set_responder_availability", async move {
            match availability {
                Availability::Available => engine.mark_available(&responder_id, &actor_id).await,
                Availability::OffDuty => engine.mark_off_duty(&responder_id, &actor_id).await,
            }
        })
        .await
    }

    async fn mark_available(&self, responder_id: &str, actor_id: &str) -> Result<Responder> {
        let _guard = self.inner.responder_locks.lock(responder_id).await;
        let responder = self.inner.registry.require(responder_id)?;
        if responder.status == ResponderStatus::Available {
            return Ok(responder);
        }
        let next = registry::mark_available(&responder)?;

        let mut unit = UnitOfWork::new();
        unit.responder(actor_id, AuditAction::ResponderAvailable, &next, None)?;
        self.commit(unit).await?;

        info!(responder_id, "Responder available");
        Ok(next)
    }

    async fn mark_off_duty(&self, responder_id: &str, actor_id: &str) -> Result<Responder> {
        loop {
            let current = self.inner.registry.require(responder_id)?;

            let Some(alert_id) = current.current_alert.clone() else {
                let _guard = self.inner.responder_locks.lock(responder_id).await;
                let responder = self.inner.registry.require(responder_id)?;
                if responder.current_alert.is_some() {
                    // Dispatched in the meantime; take the alert lock first
                    continue;
                }
                if responder.status == ResponderStatus::OffDuty {
                    return Ok(responder);
                }
                let next = registry::mark_off_duty(&responder);

                let mut unit = UnitOfWork::new();
                unit.responder(actor_id, AuditAction::ResponderOffDuty, &next, None)?;
                self.commit(unit).await?;

                info!(responder_id, "Responder off duty");
                return Ok(next);
            };

            let next = {
                let _alert_guard = self.inner.alert_locks.lock(&alert_id).await;
                let _responder_guard = self.inner.responder_locks.lock(responder_id).await;
                let responder = self.inner.registry.require(responder_id)?;
                if responder.current_alert.as_deref() != Some(alert_id.as_str()) {
                    continue;
                }

                let alert = self.alert(&alert_id)?;
                let reverted = lifecycle::revert(&alert, Utc::now())?;
                let next = registry::mark_off_duty(&responder);

                let mut unit = UnitOfWork::new();
                unit.alert(
                    actor_id,
                    AuditAction::AlertReverted,
                    &reverted,
                    Some(json!({
                        "responder_id": responder_id,
                        "previous_status": alert.status,
                        "reason": "responder off duty",
                    })),
                )?;
                unit.responder(
                    actor_id,
                    AuditAction::ResponderOffDuty,
                    &next,
                    Some(json!({ "released_alert": alert_id })),
                )?;
                self.commit(unit).await?;
                self.inner.timers.cancel(&alert_id);
                next
            };

            warn!(
                responder_id,
                alert_id = %alert_id,
                "Responder went off duty while dispatched; alert reverted"
            );
            if let Err(e) = self.dispatch_now(&alert_id, self.system_actor()).await {
                warn!(alert_id = %alert_id, error = %e, "Re-dispatch failed; sweep will retry");
            }
            return Ok(next);
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// One background pass: expire overdue assignments, escalate alerts
    /// past the triage SLA, then retry dispatch for every triaged alert.
    pub async fn sweep(&self) -> SweepReport {
        let engine = self.clone();
        match tokio::spawn(async move { engine.sweep_now().await }).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Sweep task failed");
                SweepReport {
                    failed: 1,
                    ..Default::default()
                }
            }
        }
    }

    async fn sweep_now(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();
        let timing = &self.inner.config.timing;
        let ack_secs = i64::try_from(timing.ack_timeout_secs).unwrap_or(i64::MAX);
        let sla_secs = i64::try_from(timing.sla_escalation_secs).unwrap_or(i64::MAX);
        let actor = self.system_actor();

        let overdue: Vec<(String, u64)> = self
            .inner
            .alerts
            .iter()
            .filter(|a| {
                a.status == AlertStatus::Assigned
                    && (now - a.last_transition_at).num_seconds() >= ack_secs
            })
            .map(|a| (a.id.clone(), a.version))
            .collect();
        for (id, version) in overdue {
            match self.expire_assignment(&id, version).await {
                Ok(true) => report.timed_out += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(alert_id = %id, error = %e, "Sweep failed to expire assignment");
                    report.failed += 1;
                }
            }
        }

        let breaching: Vec<String> = self
            .inner
            .alerts
            .iter()
            .filter(|a| {
                let since = a.escalated_at.map_or(a.last_transition_at, |e| {
                    e.max(a.last_transition_at)
                });
                a.status == AlertStatus::Triaged
                    && a.priority < Priority::Critical
                    && (now - since).num_seconds() >= sla_secs
            })
            .map(|a| a.id.clone())
            .collect();
        for id in breaching {
            match self.escalate_now(&id, "triage SLA exceeded", actor).await {
                Ok(_) => report.escalated += 1,
                Err(DispatchError::InvalidTransition { .. }) => {}
                Err(e) => {
                    error!(alert_id = %id, error = %e, "Sweep failed to escalate alert");
                    report.failed += 1;
                }
            }
        }

        let mut waiting: Vec<Alert> = self
            .inner
            .alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Triaged)
            .map(|a| a.clone())
            .collect();
        waiting.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        for alert in waiting {
            match self.dispatch_now(&alert.id, actor).await {
                Ok(DispatchOutcome::Assigned { .. }) => report.assigned += 1,
                Ok(DispatchOutcome::NoCandidate { .. }) => report.no_candidate += 1,
                Ok(DispatchOutcome::NotEligible { .. }) => {}
                Err(e) => {
                    error!(alert_id = %alert.id, error = %e, "Sweep dispatch failed");
                    report.failed += 1;
                }
            }
        }

        if report.timed_out + report.escalated + report.assigned + report.failed > 0 {
            info!(
                timed_out = report.timed_out,
                escalated = report.escalated,
                assigned = report.assigned,
                no_candidate = report.no_candidate,
                failed = report.failed,
                "Sweep completed"
            );
        } else {
            debug!(no_candidate = report.no_candidate, "Sweep completed");
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_secs`.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let interval = self.inner.config.timing.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.sweep_now().await;
            }
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_alert(&self, alert_id: &str) -> Result<Alert> {
        self.alert(alert_id)
    }

    /// Alerts matching `filter`, oldest first.
    pub fn list_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .inner
            .alerts
            .iter()
            .filter(|a| filter.matches(a))
            .map(|a| a.clone())
            .collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    pub fn get_responder(&self, responder_id: &str) -> Result<Responder> {
        self.inner.registry.require(responder_id)
    }

    pub fn list_responders(&self) -> Vec<Responder> {
        self.inner.registry.list()
    }

    pub fn list_zones(&self) -> Vec<Zone> {
        self.inner.zones.zones()
    }

    pub fn evaluate_zone(&self, point: &Coordinate) -> Result<ZoneMatch> {
        if !point.is_valid() {
            return Err(DispatchError::InvalidRequest(format!(
                "coordinate out of range: ({}, {})",
                point.lat, point.lon
            )));
        }
        Ok(self.inner.zones.evaluate(point))
    }

    /// Every audit entry about an alert or responder, oldest first.
    pub async fn audit_trail(&self, subject_id: &str) -> Vec<AuditEntry> {
        self.inner.ledger.entries_for_subject(subject_id).await
    }

    /// Verify the chain over `from..=to`.
    pub async fn verify_ledger(&self, from: u64, to: u64) -> Result<VerifyReport> {
        self.inner.ledger.verify(from, to).await.map_err(|e| match e {
            LedgerError::InvalidRange { .. } => DispatchError::InvalidRequest(e.to_string()),
            other => DispatchError::LedgerAppendFailed(other),
        })
    }

    /// Current tables, in the shape [`replay::rebuild`] produces.
    pub fn materialized_state(&self) -> MaterializedState {
        MaterializedState {
            alerts: self
                .inner
                .alerts
                .iter()
                .map(|a| (a.key().clone(), a.value().clone()))
                .collect(),
            responders: self
                .inner
                .registry
                .list()
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            tokens: self.inner.idempotency.completed().into_iter().collect(),
        }
    }
}

#[async_trait]
impl Assigner for DispatchEngine {
    async fn try_assign(&self, actor_id: &str, alert_id: &str, responder_id: &str) -> Result<Alert> {
        self.assign_locked(actor_id, alert_id, responder_id).await
    }
}

#[derive(Clone, Copy)]
enum Closing<'a> {
    Resolve(&'a str),
    Cancel(&'a str),
}

// =============================================================================
// Tests
// =============================================================================
