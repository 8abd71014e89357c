//! HTTP server wiring

use axum::{
    routing::{get, post, put},
    Router,
};
use dispatch::DispatchEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::IdentityProvider;
use crate::routes;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: DispatchEngine,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(engine: DispatchEngine, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { engine, identity }
    }
}

/// Create the gateway router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Alerts
        .route(
            "/api/alerts",
            get(routes::api_list_alerts).post(routes::api_create_alert),
        )
        .route("/api/alerts/:id", get(routes::api_get_alert))
        .route("/api/alerts/:id/acknowledge", post(routes::api_acknowledge))
        .route("/api/alerts/:id/resolve", post(routes::api_resolve))
        .route("/api/alerts/:id/cancel", post(routes::api_cancel))
        .route("/api/alerts/:id/escalate", post(routes::api_escalate))
        .route("/api/alerts/:id/archive", post(routes::api_archive))
        .route("/api/alerts/:id/dispatch", post(routes::api_dispatch))
        // Roster
        .route(
            "/api/responders",
            get(routes::api_list_responders).post(routes::api_register_responder),
        )
        .route(
            "/api/responders/:id/availability",
            put(routes::api_set_availability),
        )
        // Zones
        .route("/api/zones", get(routes::api_list_zones))
        .route("/api/zones/evaluate", post(routes::api_evaluate_zone))
        // Audit
        .route("/api/audit/subjects/:subject_id", get(routes::api_audit_trail))
        .route("/api/audit/verify", get(routes::api_verify))
        // Health check
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!("Gateway listening on {:?}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
