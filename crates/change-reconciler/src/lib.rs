//! Change reconciliation for realtime collections.
//!
//! # Architecture
//!
//! ```text
//! change feed (JSON) → ChangeFeedPayload → ChangeEvent → Snapshot::apply → Snapshot'
//! ```
//!
//! - **Copy-on-write**: every effective mutation allocates a new snapshot, so
//!   consumers detect change with [`Snapshot::ptr_eq`].
//! - **Idempotent**: duplicate inserts, and updates/deletes of unknown ids,
//!   leave the snapshot untouched.
//! - **Typed at the boundary**: wire payloads are validated into a tagged
//!   [`Change`] before they reach the reconciler.

mod error;
mod event;
mod record;
mod snapshot;

pub use error::{ReconcileError, ReconcileResult};
pub use event::{Change, ChangeEvent, ChangeFeedPayload, ChangeKind};
pub use record::{Record, RecordId};
pub use snapshot::{apply, apply_all, Snapshot};
