//! Realtime sync engine.
//!
//! Keeps a local, persisted copy of server-owned collections consistent with
//! a remote change feed, across flaky connectivity, overlapping requests, and
//! consumer teardown.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine
//!   ├── LocalCache             (durable key -> JSON, storage-updated broadcast)
//!   ├── TimeoutCoordinator     (timer forest, subtree cancellation)
//!   ├── OperationController    (newest-wins lanes, consumer scopes)
//!   └── watch(resource) ──▶ StreamSubscription actor
//!                              ├── ChangeFeedTransport (WebSocket / memory)
//!                              ├── ReconnectionManager (backoff + jitter)
//!                              └── Snapshot::apply     (idempotent reconciliation)
//! ```
//!
//! The engine is an explicitly constructed service object. Nothing is global:
//! every registry lives inside a [`SyncEngine`] and dies with
//! [`SyncEngine::shutdown`].

mod engine;
mod error;
mod watch;

pub use engine::{EngineConfig, SyncEngine};
pub use error::{EngineError, EngineResult};
pub use watch::{WatchHandle, WatchOptions};

pub use change_feed_subscription::{
    ChangeFeedTransport, MemoryTransport, SubscriptionEvent, SubscriptionState,
    SubscriptionStatus, SyncError, SyncResult, WebSocketConfig, WebSocketTransport,
};
pub use change_reconciler::{ChangeEvent, ChangeFeedPayload, ChangeKind, Record, RecordId, Snapshot};
pub use local_cache::LocalCache;
pub use operation_controller::{ConsumerScope, Lane, OperationToken};
pub use timeout_coordinator::TimeoutId;
