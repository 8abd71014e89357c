//! HTTP routes
//!
//! Handlers for alert commands, roster sync, zone lookups and audit queries.
//! Each handler resolves the caller, checks the role it needs and forwards
//! to the engine; the caller's actor id becomes the audit actor.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use dispatch::{
    Alert, AlertFilter, AlertKind, AlertStatus, Availability, Coordinate, DispatchOutcome,
    NewAlert, NewResponder, Priority, Responder, Zone, ZoneMatch,
};
use ledger::{AuditEntry, VerifyReport};
use serde::{Deserialize, Serialize};

use crate::auth::{Identity, Role};
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Header accepted in place of the `idempotency_token` body field.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Body field wins; the header is the fallback. Blank tokens are left for
/// the engine to reject.
fn idempotency_token(headers: &HeaderMap, body: String) -> String {
    if !body.trim().is_empty() {
        return body;
    }
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default()
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

// === Alerts ===

/// Alert report from a reporter
#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    pub kind: AlertKind,
    #[serde(default)]
    pub location: Option<Coordinate>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// POST /api/alerts
pub async fn api_create_alert(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<CreateAlertRequest>,
) -> ApiResult<(StatusCode, Json<Alert>)> {
    identity.require(Role::Reporter)?;

    let input = NewAlert {
        kind: req.kind,
        location: req.location,
        description: req.description,
        reporter_id: identity.actor_id,
        priority: req.priority,
    };
    let alert = state.engine.create_alert(input).await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

/// Listing filters
#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    pub status: Option<AlertStatus>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub archived: bool,
}

/// GET /api/alerts
pub async fn api_list_alerts(
    State(state): State<AppState>,
    _identity: Identity,
    Query(query): Query<AlertQuery>,
) -> Json<Vec<Alert>> {
    let filter = AlertFilter {
        status: query.status,
        priority: query.priority,
        include_archived: query.archived,
    };
    Json(state.engine.list_alerts(&filter))
}

/// GET /api/alerts/:id
pub async fn api_get_alert(
    State(state): State<AppState>,
    _identity: Identity,
    Path(alert_id): Path<String>,
) -> ApiResult<Json<Alert>> {
    Ok(Json(state.engine.get_alert(&alert_id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct AcknowledgeRequest {
    #[serde(default)]
    pub idempotency_token: String,
}

/// POST /api/alerts/:id/acknowledge
///
/// The caller is the acknowledging responder.
pub async fn api_acknowledge(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AcknowledgeRequest>,
) -> ApiResult<Json<Alert>> {
    identity.require(Role::Responder)?;
    let token = idempotency_token(&headers, req.idempotency_token);

    let alert = state
        .engine
        .acknowledge(&alert_id, &identity.actor_id, &token)
        .await?;
    Ok(Json(alert))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub note: String,
    #[serde(default)]
    pub idempotency_token: String,
}

/// POST /api/alerts/:id/resolve
///
/// The caller must be the responder assigned to the alert.
pub async fn api_resolve(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<Json<Alert>> {
    identity.require(Role::Responder)?;
    let token = idempotency_token(&headers, req.idempotency_token);

    let alert = state
        .engine
        .resolve(&alert_id, &req.note, &token, &identity.actor_id)
        .await?;
    Ok(Json(alert))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    #[serde(default)]
    pub idempotency_token: String,
}

/// POST /api/alerts/:id/cancel
pub async fn api_cancel(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<Alert>> {
    identity.require(Role::Reporter)?;
    let token = idempotency_token(&headers, req.idempotency_token);

    let alert = state
        .engine
        .cancel(&alert_id, &req.reason, &token, &identity.actor_id)
        .await?;
    Ok(Json(alert))
}

#[derive(Debug, Deserialize)]
pub struct EscalateRequest {
    pub reason: String,
}

/// POST /api/alerts/:id/escalate
pub async fn api_escalate(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<String>,
    Json(req): Json<EscalateRequest>,
) -> ApiResult<Json<Alert>> {
    identity.require(Role::Dispatcher)?;
    let alert = state
        .engine
        .escalate(&alert_id, &req.reason, &identity.actor_id)
        .await?;
    Ok(Json(alert))
}

/// POST /api/alerts/:id/archive
pub async fn api_archive(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<String>,
) -> ApiResult<Json<Alert>> {
    identity.require(Role::Dispatcher)?;
    let alert = state.engine.archive(&alert_id, &identity.actor_id).await?;
    Ok(Json(alert))
}

/// POST /api/alerts/:id/dispatch
pub async fn api_dispatch(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<String>,
) -> ApiResult<Json<DispatchOutcome>> {
    identity.require(Role::Dispatcher)?;
    let outcome = state.engine.dispatch(&alert_id, &identity.actor_id).await?;
    Ok(Json(outcome))
}

// === Responders ===

/// GET /api/responders
pub async fn api_list_responders(
    State(state): State<AppState>,
    _identity: Identity,
) -> Json<Vec<Responder>> {
    Json(state.engine.list_responders())
}

/// POST /api/responders
pub async fn api_register_responder(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<NewResponder>,
) -> ApiResult<Json<Responder>> {
    identity.require(Role::Roster)?;
    let responder = state
        .engine
        .register_responder(req, &identity.actor_id)
        .await?;
    Ok(Json(responder))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailabilityRequest {
    pub availability: Availability,
}

/// PUT /api/responders/:id/availability
pub async fn api_set_availability(
    State(state): State<AppState>,
    identity: Identity,
    Path(responder_id): Path<String>,
    Json(req): Json<AvailabilityRequest>,
) -> ApiResult<Json<Responder>> {
    identity.require(Role::Roster)?;
    let responder = state
        .engine
        .set_responder_availability(&responder_id, req.availability, &identity.actor_id)
        .await?;
    Ok(Json(responder))
}

// === Zones ===

/// GET /api/zones
pub async fn api_list_zones(State(state): State<AppState>, _identity: Identity) -> Json<Vec<Zone>> {
    Json(state.engine.list_zones())
}

/// POST /api/zones/evaluate
pub async fn api_evaluate_zone(
    State(state): State<AppState>,
    _identity: Identity,
    Json(point): Json<Coordinate>,
) -> ApiResult<Json<ZoneMatch>> {
    Ok(Json(state.engine.evaluate_zone(&point)?))
}

// === Audit ===

/// GET /api/audit/subjects/:subject_id
pub async fn api_audit_trail(
    State(state): State<AppState>,
    identity: Identity,
    Path(subject_id): Path<String>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    identity.require(Role::Operator)?;
    Ok(Json(state.engine.audit_trail(&subject_id).await))
}

/// Inclusive sequence range; defaults cover the whole chain
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub from: u64,
    #[serde(default = "default_verify_to")]
    pub to: u64,
}

fn default_verify_to() -> u64 {
    u64::MAX
}

/// GET /api/audit/verify
///
/// A broken chain is reported in the body, not as an error status.
pub async fn api_verify(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<VerifyReport>> {
    identity.require(Role::Operator)?;
    if query.from > query.to {
        return Err(ApiError::bad_request(format!(
            "from ({}) must not exceed to ({})",
            query.from, query.to
        )));
    }
    let report = state.engine.verify_ledger(query.from, query.to).await?;
    Ok(Json(report))
}
