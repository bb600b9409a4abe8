//! Consumer handles on shared subscriptions.

use change_feed_subscription::{
    StreamSubscription, SubscriptionEvent, SubscriptionOptions, SubscriptionState,
    SubscriptionStatus, SyncError, SyncResult,
};
use change_reconciler::{ChangeEvent, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Per-watch overrides. Unset fields use the engine defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchOptions {
    pub max_retries: Option<u32>,
    pub initial_retry_delay: Option<Duration>,
    pub max_retry_delay: Option<Duration>,
    pub notify_on_change: bool,
}

impl WatchOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = Some(delay);
        self
    }

    pub fn notify_on_change(mut self) -> Self {
        self.notify_on_change = true;
        self
    }

    pub(crate) fn resolve(&self, defaults: &SubscriptionOptions) -> SubscriptionOptions {
        SubscriptionOptions {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_retry_delay: self
                .initial_retry_delay
                .unwrap_or(defaults.initial_retry_delay),
            max_retry_delay: self.max_retry_delay.unwrap_or(defaults.max_retry_delay),
            notify_on_change: self.notify_on_change || defaults.notify_on_change,
            ..defaults.clone()
        }
    }
}

/// A consumer's view of a watched resource.
///
/// Handles for the same resource share one subscription. The subscription
/// stops when the last handle is dropped.
#[derive(Clone, Debug)]
pub struct WatchHandle {
    subscription: Arc<StreamSubscription>,
}

impl WatchHandle {
    pub(crate) fn new(subscription: Arc<StreamSubscription>) -> Self {
        Self { subscription }
    }

    pub fn resource(&self) -> &str {
        self.subscription.resource()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.subscription.snapshot()
    }

    pub fn is_loading(&self) -> bool {
        self.subscription.is_loading()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.subscription.last_error()
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.subscription.status()
    }

    pub async fn refresh(&self) -> SyncResult<Snapshot> {
        self.subscription.refresh().await
    }

    pub async fn apply_optimistic(&self, event: ChangeEvent) -> SyncResult<Snapshot> {
        self.subscription.apply_optimistic(event).await
    }

    /// Stop receiving changes. Affects every handle on this resource.
    pub async fn unsubscribe(&self) {
        self.subscription.unsubscribe().await
    }

    pub async fn resubscribe(&self) {
        self.subscription.resubscribe().await
    }

    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.subscription.snapshots()
    }

    pub fn statuses(&self) -> watch::Receiver<SubscriptionStatus> {
        self.subscription.statuses()
    }

    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.subscription.events()
    }

    /// Whether both handles share a subscription.
    pub fn same_subscription(&self, other: &WatchHandle) -> bool {
        Arc::ptr_eq(&self.subscription, &other.subscription)
    }
}
