//! Emergency alert dispatch.
//!
//! Tracks alerts from report to resolution, matches them to responders and
//! records every change in the tamper-evident [`ledger`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     DispatchEngine                       │
//! │                                                          │
//! │  ZoneEvaluator ──► lifecycle ──► UnitOfWork ──► ledger   │
//! │                        ▲              │                  │
//! │  DispatchMatcher ──────┘              ▼                  │
//! │        │                     alerts / ResponderRegistry  │
//! │        └── ResponderRegistry           │                 │
//! │                                        ▼                 │
//! │                               EngineEvent broadcast      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The ledger is the source of truth: [`replay::rebuild`] reconstructs the
//! alert and responder tables from it, and the engine does so on startup.
//!
//! # Example
//!
//! ```ignore
//! use dispatch::{AlertKind, Coordinate, DispatchEngine, EngineConfig, NewAlert};
//!
//! let engine = DispatchEngine::new(EngineConfig::default(), ledger).await?;
//! let alert = engine
//!     .create_alert(NewAlert::new(AlertKind::Medical, "reporter-1").at(Coordinate::new(51.5, -0.12)))
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod lifecycle;
pub mod locks;
pub mod matcher;
pub mod registry;
pub mod replay;
pub mod timers;
pub mod types;
pub mod unit;
pub mod zones;

pub use config::{DispatchConfig, EngineConfig, SearchRadii, TimingConfig};
pub use engine::{DispatchEngine, SweepReport};
pub use error::{DispatchError, Result};
pub use events::EngineEvent;
pub use matcher::{Assigner, DispatchMatcher, DispatchOutcome};
pub use registry::{Candidate, ResponderRegistry};
pub use replay::{no_candidate_versions, rebuild, AuditPayload, MaterializedState};
pub use types::*;
pub use zones::{ZoneError, ZoneEvaluator, ZoneMatch};
