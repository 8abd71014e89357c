//! Dispatch gateway
//!
//! HTTP/JSON front door for the [`dispatch`] engine: alert commands,
//! roster sync, zone lookups and audit queries, with bearer-token identity
//! and notification fan-out for committed events.

pub mod auth;
pub mod config;
pub mod error;
pub mod notify;
pub mod routes;
pub mod server;

pub use auth::{DevModeProvider, Identity, IdentityProvider, Role, StaticTokenProvider};
pub use config::Args;
pub use error::{ApiError, ApiResult, ErrorBody};
pub use notify::{spawn_notifier, LoggingNotifier, Notifier};
pub use server::{create_router, run, AppState};
