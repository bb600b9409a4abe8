//! Live subscriptions to a server-owned collection.
//!
//! # Architecture
//!
//! ```text
//! ChangeFeedTransport ──FeedMessage──▶ StreamSubscription (actor) ──▶ watch<Snapshot>
//!        ▲                                  │    │                ──▶ watch<SubscriptionStatus>
//!        │ resubscribe                      │    └──▶ LocalCache  ──▶ broadcast<SubscriptionEvent>
//!        └──── ReconnectionManager ◀────────┘ transport failure
//! ```
//!
//! Each subscription is a single tokio task. Feed messages, commands,
//! connectivity changes, and cache notifications are handled in one loop, so
//! changes for a resource are reconciled strictly in delivery order.
//!
//! Transports:
//! - [`MemoryTransport`]: in-process feed for tests and demos
//! - [`WebSocketTransport`]: JSON frames over a WebSocket connection

mod error;
mod memory;
mod protocol;
mod reconnect;
mod state;
mod subscription;
mod transport;
mod websocket;

pub use error::{SyncError, SyncResult, TransportError, TransportResult};
pub use memory::MemoryTransport;
pub use protocol::{ClientFrame, ServerFrame};
pub use reconnect::{compute_backoff, ReconnectionManager, RetryDecision, RetryPolicy};
pub use state::{SubscriptionEvent, SubscriptionState, SubscriptionStatus};
pub use subscription::{StreamSubscription, SubscriptionContext, SubscriptionOptions};
pub use transport::{ChangeFeedTransport, FeedMessage};
pub use websocket::{WebSocketConfig, WebSocketTransport};
