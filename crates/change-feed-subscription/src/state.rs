//! Subscription lifecycle state and consumer-facing status.

use crate::SyncError;
use change_reconciler::{ChangeKind, RecordId};
use std::fmt;

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Subscribed,
    Reconnecting,
    Failed,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Idle => "idle",
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Reconnecting => "reconnecting",
            SubscriptionState::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// `Reconnecting` is also reachable from `Idle` and `Failed` when a
    /// subscribe is requested while the host is offline.
    pub fn can_transition_to(&self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;
        match (*self, next) {
            (from, to) if from == to => false,
            (_, Idle) => true,
            (Idle | Failed | Reconnecting | Subscribed, Connecting) => true,
            (Connecting, Subscribed) => true,
            (Connecting | Subscribed | Idle | Failed, Reconnecting) => true,
            (Reconnecting, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a subscription for consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    /// A connect or refresh is in flight.
    pub is_loading: bool,
    pub last_error: Option<SyncError>,
    /// Retries scheduled since the last successful subscribe.
    pub attempt: u32,
    /// A snapshot exists, from the cache, the caller's seed, or the server.
    pub has_data: bool,
}

impl SubscriptionStatus {
    pub(crate) fn initial(has_data: bool) -> Self {
        Self {
            state: SubscriptionState::Idle,
            is_loading: false,
            last_error: None,
            attempt: 0,
            has_data,
        }
    }

    /// Data is available but the feed is not live.
    pub fn is_stale(&self) -> bool {
        self.has_data && self.state != SubscriptionState::Subscribed
    }
}

/// Notifications broadcast by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    StateChanged {
        from: SubscriptionState,
        to: SubscriptionState,
    },
    /// An effective change was applied. Only sent with `notify_on_change`.
    Changed {
        kind: ChangeKind,
        record_id: RecordId,
    },
    /// The snapshot was replaced wholesale.
    Refreshed { records: usize },
    Error(SyncError),
}
