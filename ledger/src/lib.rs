//! Tamper-evident audit ledger.
//!
//! Every state change in the dispatch engine is recorded here as an
//! [`AuditEntry`]. Entries form a SHA-256 hash chain: each entry commits to
//! its own content and to the hash of the entry before it, so altering,
//! reordering or removing any entry breaks every link after it.
//!
//! # Key Components
//!
//! - [`AuditLedger`]: serialized append path, concurrent reads, chain verification
//! - [`LedgerStore`]: storage seam with [`MemoryLedgerStore`] and [`FileLedgerStore`]
//! - [`hash`]: canonical payload hashing and entry digests
//!
//! # Example
//!
//! ```ignore
//! use ledger::{AuditAction, AuditLedger, MemoryLedgerStore, PendingEntry};
//!
//! let ledger = AuditLedger::open(Arc::new(MemoryLedgerStore::new())).await?;
//! let entry = ledger
//!     .append(PendingEntry::new("dispatcher-1", AuditAction::AlertCreated, "alert-1", payload))
//!     .await?;
//! assert!(ledger.verify(0, entry.sequence).await?.valid);
//! ```

pub mod chain;
pub mod hash;
pub mod store;
pub mod types;

pub use chain::{verify_entries, AuditLedger};
pub use store::{FileLedgerStore, LedgerStore, MemoryLedgerStore};
pub use types::*;
