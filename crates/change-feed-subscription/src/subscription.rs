//! The subscription actor.

use crate::{
    ChangeFeedTransport, FeedMessage, ReconnectionManager, RetryDecision, RetryPolicy,
    SubscriptionEvent, SubscriptionState, SubscriptionStatus, SyncError, SyncResult,
    TransportError, TransportResult,
};
use change_reconciler::{ChangeEvent, Record, Snapshot};
use local_cache::{LocalCache, StorageUpdated};
use operation_controller::{Lane, OperationController, OperationResult, OperationToken};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-subscription tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    /// Resubscribe attempts before giving up.
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub jitter_ratio: f64,
    /// Broadcast [`SubscriptionEvent::Changed`] for every effective change.
    pub notify_on_change: bool,
    /// Upper bound on a single subscribe call.
    pub handshake_timeout: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_attempts,
            initial_retry_delay: policy.initial_delay,
            max_retry_delay: policy.max_delay,
            jitter_ratio: policy.jitter_ratio,
            notify_on_change: false,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl SubscriptionOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: self.initial_retry_delay,
            max_delay: self.max_retry_delay,
            max_attempts: self.max_retries,
            jitter_ratio: self.jitter_ratio,
        }
    }
}

/// Shared services a subscription runs against.
#[derive(Clone)]
pub struct SubscriptionContext {
    pub transport: Arc<dyn ChangeFeedTransport>,
    pub cache: LocalCache,
    pub operations: OperationController,
    /// Host connectivity; `true` when online.
    pub online: watch::Receiver<bool>,
}

enum Command {
    Subscribe,
    Unsubscribe,
    Resubscribe,
    Refresh(oneshot::Sender<SyncResult<Snapshot>>),
    ApplyLocal(ChangeEvent, oneshot::Sender<Snapshot>),
    Shutdown,
}

enum Internal {
    Connected {
        token: OperationToken,
        result: TransportResult<mpsc::Receiver<FeedMessage>>,
    },
    Refreshed {
        token: OperationToken,
        outcome: OperationResult<TransportResult<Option<Vec<Record>>>>,
        reply: oneshot::Sender<SyncResult<Snapshot>>,
    },
    RetryFired,
}

/// Handle on a running subscription to one resource.
///
/// The subscription starts connecting as soon as it is spawned and stops
/// when the handle is dropped or [`StreamSubscription::shutdown`] is called.
pub struct StreamSubscription {
    resource: String,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
    statuses: watch::Receiver<SubscriptionStatus>,
    events: broadcast::Sender<SubscriptionEvent>,
}

impl StreamSubscription {
    /// Spawn the subscription actor. Must be called within a tokio runtime.
    ///
    /// The initial snapshot is the cached value for `resource` if there is a
    /// readable one, else `seed`, else empty.
    pub fn spawn(
        resource: impl Into<String>,
        seed: Option<Snapshot>,
        options: SubscriptionOptions,
        ctx: SubscriptionContext,
    ) -> Self {
        let resource = resource.into();
        let cache_synced = ctx.cache.get(&resource);
        let (snapshot, has_data) = initial_snapshot(cache_synced.clone(), &resource, seed);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(snapshot.clone());
        let (status_tx, statuses) = watch::channel(SubscriptionStatus::initial(has_data));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let online = *ctx.online.borrow();
        let storage = ctx.cache.subscribe();
        let actor = SubscriptionActor {
            reconnect: ReconnectionManager::new(
                options.retry_policy(),
                ctx.operations.timeouts().clone(),
                &resource,
            ),
            connect_lane: Lane::new(format!("subscribe:{resource}#{id}")),
            refresh_lane: Lane::new(format!("refresh:{resource}#{id}")),
            resource: resource.clone(),
            options,
            transport: ctx.transport,
            cache: ctx.cache,
            operations: ctx.operations,
            snapshot,
            state: SubscriptionState::Idle,
            feed: None,
            connect_token: None,
            refresh_token: None,
            cache_synced,
            cache_behind: false,
            online,
            has_data,
            last_error: None,
            snapshot_tx,
            status_tx,
            events: events.clone(),
            internal_tx,
        };

        debug!(resource = %resource, id, "Spawning subscription");
        tokio::spawn(actor.run(commands_rx, internal_rx, Some(ctx.online), Some(storage)));

        Self {
            resource,
            commands: commands_tx,
            snapshots,
            statuses,
            events,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Latest reconciled snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.statuses.borrow().clone()
    }

    pub fn state(&self) -> SubscriptionState {
        self.statuses.borrow().state
    }

    pub fn is_loading(&self) -> bool {
        self.statuses.borrow().is_loading
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.statuses.borrow().last_error.clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn statuses(&self) -> watch::Receiver<SubscriptionStatus> {
        self.statuses.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    /// Connect if idle; from `Failed` this starts a fresh retry sequence.
    pub async fn subscribe(&self) {
        self.send(Command::Subscribe).await;
    }

    pub async fn unsubscribe(&self) {
        self.send(Command::Unsubscribe).await;
    }

    /// Drop the current feed and connect again with a fresh retry sequence.
    pub async fn resubscribe(&self) {
        self.send(Command::Resubscribe).await;
    }

    /// Reload the full collection. Overlapping refreshes are newest-wins; a
    /// superseded refresh fails with [`SyncError::Cancelled`].
    pub async fn refresh(&self) -> SyncResult<Snapshot> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Refresh(reply)).await.is_err() {
            return Err(SyncError::Cancelled);
        }
        rx.await.unwrap_or(Err(SyncError::Cancelled))
    }

    /// Apply a local change ahead of the server, in order with remote
    /// changes. Returns the resulting snapshot.
    pub async fn apply_optimistic(&self, event: ChangeEvent) -> SyncResult<Snapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::ApplyLocal(event, reply))
            .await
            .is_err()
        {
            return Err(SyncError::Cancelled);
        }
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Stop the actor. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            debug!(resource = %self.resource, "Subscription already stopped");
        }
    }
}

impl std::fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("resource", &self.resource)
            .field("state", &self.state())
            .finish()
    }
}

fn initial_snapshot(
    cached: Option<Value>,
    resource: &str,
    seed: Option<Snapshot>,
) -> (Snapshot, bool) {
    if let Some(value) = cached {
        match Snapshot::from_value(value) {
            Ok(snapshot) => {
                debug!(resource = %resource, records = snapshot.len(), "Seeded from cache");
                return (snapshot, true);
            }
            Err(err) => {
                warn!(resource = %resource, error = %err, "Cached snapshot unreadable; using seed")
            }
        }
    }
    match seed {
        Some(seed) => (seed, true),
        None => (Snapshot::empty(), false),
    }
}

struct SubscriptionActor {
    resource: String,
    options: SubscriptionOptions,
    transport: Arc<dyn ChangeFeedTransport>,
    cache: LocalCache,
    operations: OperationController,
    reconnect: ReconnectionManager,
    connect_lane: Lane,
    refresh_lane: Lane,

    snapshot: Snapshot,
    state: SubscriptionState,
    feed: Option<mpsc::Receiver<FeedMessage>>,
    connect_token: Option<OperationToken>,
    refresh_token: Option<OperationToken>,
    /// Last value this actor knows the cache holds for `resource`.
    cache_synced: Option<Value>,
    /// The snapshot is newer than the cache because a write failed.
    cache_behind: bool,
    online: bool,
    has_data: bool,
    last_error: Option<SyncError>,

    snapshot_tx: watch::Sender<Snapshot>,
    status_tx: watch::Sender<SubscriptionStatus>,
    events: broadcast::Sender<SubscriptionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl SubscriptionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut online: Option<watch::Receiver<bool>>,
        mut storage: Option<broadcast::Receiver<StorageUpdated>>,
    ) {
        self.subscribe();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                message = next_feed_message(&mut self.feed) => self.handle_feed_message(message),
                online_now = next_online(&mut online) => self.set_online(online_now),
                update = next_storage_update(&mut storage) => self.handle_storage_update(update),
            }
        }

        self.teardown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe => self.subscribe(),
            Command::Unsubscribe => self.unsubscribe(),
            Command::Resubscribe => self.resubscribe(),
            Command::Refresh(reply) => self.refresh(reply),
            Command::ApplyLocal(event, reply) => {
                if self.apply_event(&event) {
                    debug!(resource = %self.resource, kind = %event.kind(), record_id = %event.record_id(), "Applied optimistic change");
                }
                let _ = reply.send(self.snapshot.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Connected { token, result } => self.handle_connected(token, result),
            Internal::Refreshed {
                token,
                outcome,
                reply,
            } => self.handle_refreshed(token, outcome, reply),
            Internal::RetryFired => {
                if self.state == SubscriptionState::Reconnecting
                    && self.online
                    && self.connect_token.is_none()
                {
                    debug!(resource = %self.resource, attempt = self.reconnect.attempt(), "Retry timer fired");
                    self.connect();
                }
            }
        }
    }

    // Lifecycle

    fn subscribe(&mut self) {
        match self.state {
            SubscriptionState::Subscribed | SubscriptionState::Connecting => {
                debug!(resource = %self.resource, state = %self.state, "Already subscribing");
            }
            SubscriptionState::Idle | SubscriptionState::Failed => {
                self.reconnect.reset();
                self.connect();
            }
            SubscriptionState::Reconnecting => {
                self.reconnect.cancel_pending();
                self.connect();
            }
        }
    }

    fn unsubscribe(&mut self) {
        self.cancel_connect();
        self.reconnect.reset();
        if self.feed.take().is_some() {
            debug!(resource = %self.resource, "Feed released");
        }
        self.transition(SubscriptionState::Idle);
    }

    fn resubscribe(&mut self) {
        self.cancel_connect();
        self.feed = None;
        self.reconnect.reset();
        self.connect();
    }

    fn connect(&mut self) {
        self.feed = None;
        if !self.online {
            debug!(resource = %self.resource, "Offline; deferring subscribe");
            self.cancel_connect();
            self.transition(SubscriptionState::Reconnecting);
            return;
        }

        let token = self.operations.new_token(self.connect_lane.clone());
        self.connect_token = Some(token.clone());
        self.transition(SubscriptionState::Connecting);

        let transport = self.transport.clone();
        let resource = self.resource.clone();
        let internal = self.internal_tx.clone();
        let handshake_timeout = self.options.handshake_timeout;
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(handshake_timeout, transport.subscribe(&resource));
            let result = match token.guard(attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(TransportError::HandshakeTimeout(handshake_timeout)),
                Err(_) => {
                    debug!(resource = %resource, "Subscribe attempt cancelled");
                    return;
                }
            };
            let _ = internal.send(Internal::Connected { token, result });
        });
    }

    fn cancel_connect(&mut self) {
        if let Some(token) = self.connect_token.take() {
            self.operations.cancel(&token);
        }
    }

    fn handle_connected(
        &mut self,
        token: OperationToken,
        result: TransportResult<mpsc::Receiver<FeedMessage>>,
    ) {
        if self.connect_token.as_ref() != Some(&token) || !token.is_live() {
            trace!(resource = %self.resource, "Ignoring stale subscribe result");
            return;
        }
        self.connect_token = None;
        self.operations.complete(&token);

        match result {
            Ok(feed) => {
                info!(resource = %self.resource, "Subscribed to change feed");
                self.feed = Some(feed);
                self.reconnect.on_success();
                self.last_error = None;
                self.transition(SubscriptionState::Subscribed);
            }
            Err(err) => self.handle_failure(err.into()),
        }
    }

    fn handle_failure(&mut self, error: SyncError) {
        self.feed = None;
        warn!(resource = %self.resource, error = %error, "Change feed failed");
        self.record_error(error);

        if !self.online {
            self.transition(SubscriptionState::Reconnecting);
            return;
        }

        let internal = self.internal_tx.clone();
        let decision = self.reconnect.on_failure(move || {
            let _ = internal.send(Internal::RetryFired);
        });
        match decision {
            RetryDecision::Scheduled { .. } => self.transition(SubscriptionState::Reconnecting),
            RetryDecision::Exhausted { attempts } => {
                error!(resource = %self.resource, attempts, "Giving up on change feed");
                self.record_error(SyncError::ExhaustedRetries { attempts });
                // Failed is only reachable from Reconnecting
                self.transition(SubscriptionState::Reconnecting);
                self.transition(SubscriptionState::Failed);
            }
        }
    }

    fn set_online(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        self.online = online;

        if online {
            info!(resource = %self.resource, "Host online");
            if self.state == SubscriptionState::Reconnecting {
                self.reconnect.cancel_pending();
                self.connect();
            }
        } else {
            info!(resource = %self.resource, "Host offline");
            self.reconnect.cancel_pending();
            if matches!(
                self.state,
                SubscriptionState::Subscribed | SubscriptionState::Connecting
            ) {
                self.cancel_connect();
                self.feed = None;
                self.transition(SubscriptionState::Reconnecting);
            }
        }
    }

    fn teardown(&mut self) {
        self.cancel_connect();
        if let Some(token) = self.refresh_token.take() {
            self.operations.cancel(&token);
        }
        self.reconnect.shutdown();
        self.feed = None;
        self.transition(SubscriptionState::Idle);
        debug!(resource = %self.resource, "Subscription stopped");
    }

    // Data

    fn handle_feed_message(&mut self, message: Option<FeedMessage>) {
        match message {
            Some(FeedMessage::Change(payload)) => match ChangeEvent::try_from(payload) {
                Ok(event) => {
                    self.apply_event(&event);
                }
                Err(err) => {
                    warn!(resource = %self.resource, error = %err, "Dropping malformed change");
                    let _ = self.events.send(SubscriptionEvent::Error(err.into()));
                }
            },
            Some(FeedMessage::Snapshot(records)) => {
                let next = Snapshot::from_records(records);
                if next != self.snapshot {
                    self.commit(next, true);
                }
                let _ = self.events.send(SubscriptionEvent::Refreshed {
                    records: self.snapshot.len(),
                });
            }
            Some(FeedMessage::Error(message)) => {
                warn!(resource = %self.resource, error = %message, "Change feed reported an error");
                let _ = self
                    .events
                    .send(SubscriptionEvent::Error(SyncError::Transport(message)));
            }
            None => self.handle_failure(SyncError::Transport(
                "change feed disconnected".to_string(),
            )),
        }
    }

    /// Reconcile one event. Returns whether the snapshot changed.
    fn apply_event(&mut self, event: &ChangeEvent) -> bool {
        let next = self.snapshot.apply(event);
        if next.ptr_eq(&self.snapshot) {
            trace!(resource = %self.resource, kind = %event.kind(), record_id = %event.record_id(), "Change had no effect");
            return false;
        }
        self.commit(next, true);
        if self.options.notify_on_change {
            let _ = self.events.send(SubscriptionEvent::Changed {
                kind: event.kind(),
                record_id: event.record_id().clone(),
            });
        }
        true
    }

    /// Adopt `next`, optionally persist it, and publish it.
    fn commit(&mut self, next: Snapshot, persist: bool) {
        self.snapshot = next;
        self.has_data = true;
        if persist {
            self.persist();
        } else {
            self.cache_synced = Some(self.snapshot.to_value());
            self.cache_behind = false;
        }
        self.snapshot_tx.send_replace(self.snapshot.clone());
        self.publish_status();
    }

    fn persist(&mut self) {
        let value = self.snapshot.to_value();
        if self.cache.set(&self.resource, &value) {
            self.cache_synced = Some(value);
            self.cache_behind = false;
        } else {
            debug!(resource = %self.resource, "Snapshot kept in memory only");
            self.cache_behind = true;
        }
    }

    fn handle_storage_update(&mut self, update: Option<StorageUpdated>) {
        if let Some(update) = &update {
            if update.key != self.resource {
                return;
            }
        }
        // Our own writes echo back here too; comparing against the cache's
        // current value makes them no-ops
        let Some(value) = self.cache.get(&self.resource) else {
            return;
        };
        if self.cache_behind && self.cache_synced.as_ref() == Some(&value) {
            trace!(resource = %self.resource, "Cache still behind the in-memory snapshot");
            return;
        }
        match Snapshot::from_value(value) {
            Ok(cached) if cached != self.snapshot => {
                debug!(resource = %self.resource, records = cached.len(), "Adopting snapshot written by another consumer");
                self.commit(cached, false);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(resource = %self.resource, error = %err, "Ignoring unreadable cache update")
            }
        }
    }

    fn refresh(&mut self, reply: oneshot::Sender<SyncResult<Snapshot>>) {
        let token = self.operations.new_token(self.refresh_lane.clone());
        self.refresh_token = Some(token.clone());
        self.publish_status();

        let transport = self.transport.clone();
        let resource = self.resource.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = token.guard(transport.fetch_snapshot(&resource)).await;
            let _ = internal.send(Internal::Refreshed {
                token,
                outcome,
                reply,
            });
        });
    }

    fn handle_refreshed(
        &mut self,
        token: OperationToken,
        outcome: OperationResult<TransportResult<Option<Vec<Record>>>>,
        reply: oneshot::Sender<SyncResult<Snapshot>>,
    ) {
        let current = self.refresh_token.as_ref() == Some(&token);
        if current {
            self.refresh_token = None;
        }

        let result = match outcome {
            Ok(fetched) if current && token.is_live() => {
                self.operations.complete(&token);
                self.apply_refresh(fetched)
            }
            _ => {
                debug!(resource = %self.resource, "Refresh superseded");
                Err(SyncError::Cancelled)
            }
        };
        self.publish_status();
        let _ = reply.send(result);
    }

    fn apply_refresh(
        &mut self,
        fetched: TransportResult<Option<Vec<Record>>>,
    ) -> SyncResult<Snapshot> {
        match fetched {
            Ok(Some(records)) => {
                let next = Snapshot::from_records(records);
                if next != self.snapshot {
                    self.commit(next, true);
                }
            }
            Ok(None) => {
                trace!(resource = %self.resource, "Transport has no snapshot support; rereading cache");
                self.handle_storage_update(None);
                if self.cache_behind {
                    debug!(resource = %self.resource, "Retrying cache write");
                    self.persist();
                }
            }
            Err(err) => {
                let err = SyncError::from(err);
                warn!(resource = %self.resource, error = %err, "Refresh failed");
                let _ = self.events.send(SubscriptionEvent::Error(err.clone()));
                return Err(err);
            }
        }
        info!(resource = %self.resource, records = self.snapshot.len(), "Refreshed");
        let _ = self.events.send(SubscriptionEvent::Refreshed {
            records: self.snapshot.len(),
        });
        Ok(self.snapshot.clone())
    }

    // Publishing

    fn record_error(&mut self, error: SyncError) {
        self.last_error = Some(error.clone());
        let _ = self.events.send(SubscriptionEvent::Error(error));
    }

    fn transition(&mut self, next: SubscriptionState) {
        let from = self.state;
        if from == next {
            self.publish_status();
            return;
        }
        if !from.can_transition_to(next) {
            warn!(resource = %self.resource, from = %from, to = %next, "Ignoring illegal state transition");
            return;
        }

        self.state = next;
        info!(resource = %self.resource, from = %from, to = %next, "Subscription state changed");
        self.publish_status();
        let _ = self
            .events
            .send(SubscriptionEvent::StateChanged { from, to: next });
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SubscriptionStatus {
            state: self.state,
            is_loading: self.connect_token.is_some() || self.refresh_token.is_some(),
            last_error: self.last_error.clone(),
            attempt: self.reconnect.attempt(),
            has_data: self.has_data,
        });
    }
}

async fn next_feed_message(feed: &mut Option<mpsc::Receiver<FeedMessage>>) -> Option<FeedMessage> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_online(online: &mut Option<watch::Receiver<bool>>) -> bool {
    loop {
        let Some(rx) = online.as_mut() else {
            return std::future::pending().await;
        };
        if rx.changed().await.is_ok() {
            return *rx.borrow_and_update();
        }
        // Connectivity source is gone; keep the last known value
        *online = None;
    }
}

/// `None` means updates were missed and the cache should be reread.
async fn next_storage_update(
    storage: &mut Option<broadcast::Receiver<StorageUpdated>>,
) -> Option<StorageUpdated> {
    loop {
        let Some(rx) = storage.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(update) => return Some(update),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Cache notifications lagged");
                return None;
            }
            Err(broadcast::error::RecvError::Closed) => *storage = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;
    use async_trait::async_trait;
    use change_reconciler::{ChangeFeedPayload, ChangeKind, RecordId};
    use local_cache::{CacheBackend, CacheError, CacheResult, MemoryBackend};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use timeout_coordinator::TimeoutCoordinator;

    struct Harness {
        transport: MemoryTransport,
        cache: LocalCache,
        operations: OperationController,
        online: watch::Sender<bool>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_cache(LocalCache::in_memory())
        }

        fn with_cache(cache: LocalCache) -> Self {
            let (online, _) = watch::channel(true);
            Self {
                transport: MemoryTransport::new(),
                cache,
                operations: OperationController::new(TimeoutCoordinator::new()),
                online,
            }
        }

        fn ctx(&self) -> SubscriptionContext {
            self.ctx_with(Arc::new(self.transport.clone()))
        }

        fn ctx_with(&self, transport: Arc<dyn ChangeFeedTransport>) -> SubscriptionContext {
            SubscriptionContext {
                transport,
                cache: self.cache.clone(),
                operations: self.operations.clone(),
                online: self.online.subscribe(),
            }
        }

        fn spawn(&self, options: SubscriptionOptions) -> StreamSubscription {
            StreamSubscription::spawn("orders", None, options, self.ctx())
        }
    }

    /// Backend whose writes can be switched off.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_writes: AtomicBool,
    }

    impl CacheBackend for FlakyBackend {
        fn read(&self, key: &str) -> CacheResult<Option<String>> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, document: &str) -> CacheResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CacheError::Backend("quota exceeded".to_string()));
            }
            self.inner.write(key, document)
        }

        fn delete(&self, key: &str) -> CacheResult<bool> {
            self.inner.delete(key)
        }
    }

    /// Transport whose snapshot fetches wait for the test to release them,
    /// in the order the fetches start.
    #[derive(Default)]
    struct GatedSnapshots {
        gates: Mutex<VecDeque<oneshot::Receiver<Vec<Record>>>>,
        feeds: Mutex<Vec<mpsc::Sender<FeedMessage>>>,
    }

    impl GatedSnapshots {
        fn gate(&self) -> oneshot::Sender<Vec<Record>> {
            let (release, gate) = oneshot::channel();
            self.gates.lock().unwrap().push_back(gate);
            release
        }

        async fn wait_for_fetches(&self, pending: usize) {
            while self.gates.lock().unwrap().len() > pending {
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait]
    impl ChangeFeedTransport for GatedSnapshots {
        async fn subscribe(&self, _resource: &str) -> TransportResult<mpsc::Receiver<FeedMessage>> {
            let (tx, rx) = mpsc::channel(8);
            self.feeds.lock().unwrap().push(tx);
            Ok(rx)
        }

        async fn fetch_snapshot(&self, _resource: &str) -> TransportResult<Option<Vec<Record>>> {
            let gate = self.gates.lock().unwrap().pop_front();
            match gate {
                Some(gate) => Ok(gate.await.ok()),
                None => Ok(None),
            }
        }
    }

    fn fast_options() -> SubscriptionOptions {
        SubscriptionOptions {
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            jitter_ratio: 0.0,
            notify_on_change: true,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    fn order(id: &str, total: i64) -> Record {
        Record::new(id).with_field("total", json!(total))
    }

    async fn wait_for_state(sub: &StreamSubscription, state: SubscriptionState) -> SubscriptionStatus {
        let mut statuses = sub.statuses();
        let status = statuses
            .wait_for(|status| status.state == state)
            .await
            .unwrap()
            .clone();
        status
    }

    async fn wait_for_len(sub: &StreamSubscription, len: usize) -> Snapshot {
        let mut snapshots = sub.snapshots();
        let snapshot = snapshots
            .wait_for(|snapshot| snapshot.len() == len)
            .await
            .unwrap()
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn seeds_from_cache_before_seed_argument() {
        let harness = Harness::new();
        harness.cache.set("orders", &json!([{"id": "1", "total": 10}]));

        let seed = Snapshot::from_records(vec![order("9", 90)]);
        let sub = StreamSubscription::spawn("orders", Some(seed), fast_options(), harness.ctx());

        assert_eq!(sub.snapshot().to_value(), json!([{"id": "1", "total": 10}]));
        assert!(sub.status().has_data);
    }

    #[tokio::test]
    async fn unreadable_cache_falls_back_to_seed() {
        let harness = Harness::new();
        harness.cache.set("orders", &json!({"not": "an array"}));

        let seed = Snapshot::from_records(vec![order("9", 90)]);
        let sub = StreamSubscription::spawn("orders", Some(seed.clone()), fast_options(), harness.ctx());
        assert_eq!(sub.snapshot(), seed);
    }

    #[tokio::test]
    async fn applies_changes_and_persists() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        let mut events = sub.events();
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        harness
            .transport
            .push("orders", ChangeFeedPayload::insert("orders", &order("1", 10)));
        let snapshot = wait_for_len(&sub, 1).await;

        assert_eq!(snapshot.to_value(), json!([{"id": "1", "total": 10}]));
        assert_eq!(harness.cache.get("orders"), Some(snapshot.to_value()));

        loop {
            match events.recv().await.unwrap() {
                SubscriptionEvent::Changed { kind, record_id } => {
                    assert_eq!(kind, ChangeKind::Insert);
                    assert_eq!(record_id, RecordId::new("1"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn malformed_change_is_skipped() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        let mut bad = ChangeFeedPayload::insert("orders", &order("1", 10));
        bad.new = None;
        harness.transport.push("orders", bad);
        harness
            .transport
            .push("orders", ChangeFeedPayload::insert("orders", &order("2", 20)));

        let snapshot = wait_for_len(&sub, 1).await;
        assert!(snapshot.contains(&RecordId::new("2")));
        assert_eq!(sub.state(), SubscriptionState::Subscribed);
        assert_eq!(sub.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_schedules_retry_then_recovers() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        harness.transport.disconnect("orders");
        let status = wait_for_state(&sub, SubscriptionState::Reconnecting).await;
        assert_eq!(status.attempt, 1);
        assert!(status.last_error.is_some());

        let status = wait_for_state(&sub, SubscriptionState::Subscribed).await;
        assert_eq!(status.attempt, 0);
        assert_eq!(status.last_error, None);
        assert_eq!(harness.transport.subscribe_calls("orders"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_until_manual_subscribe() {
        let harness = Harness::new();
        harness.transport.fail_subscribes("orders", 4);
        let sub = harness.spawn(fast_options());

        let status = wait_for_state(&sub, SubscriptionState::Failed).await;
        assert_eq!(
            status.last_error,
            Some(SyncError::ExhaustedRetries { attempts: 3 })
        );
        assert_eq!(harness.transport.subscribe_calls("orders"), 4);

        sub.subscribe().await;
        wait_for_state(&sub, SubscriptionState::Subscribed).await;
        assert_eq!(harness.transport.subscribe_calls("orders"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_is_entered_from_reconnecting() {
        let harness = Harness::new();
        harness.transport.fail_subscribes("orders", 10);
        let options = SubscriptionOptions {
            max_retries: 1,
            ..fast_options()
        };
        let sub = harness.spawn(options);
        let mut events = sub.events();

        let mut transitions = Vec::new();
        loop {
            if let SubscriptionEvent::StateChanged { from, to } = events.recv().await.unwrap() {
                transitions.push((from, to));
                if to == SubscriptionState::Failed {
                    break;
                }
            }
        }

        use SubscriptionState::*;
        assert_eq!(
            transitions,
            vec![
                (Idle, Connecting),
                (Connecting, Reconnecting),
                (Reconnecting, Connecting),
                (Connecting, Reconnecting),
                (Reconnecting, Failed),
            ]
        );
        assert_eq!(
            sub.last_error(),
            Some(SyncError::ExhaustedRetries { attempts: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_counts_as_failure() {
        let harness = Harness::new();
        harness.transport.stall_subscribes("orders", true);
        let sub = harness.spawn(fast_options());

        let status = wait_for_state(&sub, SubscriptionState::Reconnecting).await;
        assert!(matches!(status.last_error, Some(SyncError::Transport(_))));

        harness.transport.stall_subscribes("orders", false);
        wait_for_state(&sub, SubscriptionState::Subscribed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_downgrades_and_online_reconnects_immediately() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        harness.online.send_replace(false);
        wait_for_state(&sub, SubscriptionState::Reconnecting).await;
        assert_eq!(harness.transport.subscriber_count("orders"), 0);

        harness.online.send_replace(true);
        wait_for_state(&sub, SubscriptionState::Subscribed).await;
        assert_eq!(harness.transport.subscribe_calls("orders"), 2);
    }

    #[tokio::test]
    async fn unsubscribe_goes_idle_and_releases_feed() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        sub.unsubscribe().await;
        wait_for_state(&sub, SubscriptionState::Idle).await;
        assert_eq!(harness.transport.subscriber_count("orders"), 0);

        sub.resubscribe().await;
        wait_for_state(&sub, SubscriptionState::Subscribed).await;
    }

    #[tokio::test]
    async fn optimistic_change_is_applied_and_cached() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());

        let snapshot = sub
            .apply_optimistic(ChangeEvent::insert(order("7", 70)))
            .await
            .unwrap();
        assert!(snapshot.contains(&RecordId::new("7")));
        assert_eq!(harness.cache.get("orders"), Some(snapshot.to_value()));
    }

    #[tokio::test]
    async fn refresh_uses_transport_snapshot() {
        let harness = Harness::new();
        harness
            .transport
            .set_snapshot("orders", vec![order("1", 10), order("2", 20)]);
        let sub = harness.spawn(fast_options());

        let snapshot = sub.refresh().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(sub.snapshot(), snapshot);
        assert_eq!(harness.cache.get("orders"), Some(snapshot.to_value()));
    }

    #[tokio::test]
    async fn refresh_without_transport_snapshot_rereads_cache() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        let snapshot = sub.refresh().await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn refresh_keeps_changes_the_cache_could_not_store() {
        let backend = Arc::new(FlakyBackend::default());
        let harness = Harness::with_cache(LocalCache::new(backend.clone()));
        let sub = harness.spawn(fast_options());
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        harness
            .transport
            .push("orders", ChangeFeedPayload::insert("orders", &order("1", 10)));
        wait_for_len(&sub, 1).await;

        backend.fail_writes.store(true, Ordering::SeqCst);
        harness
            .transport
            .push("orders", ChangeFeedPayload::insert("orders", &order("2", 20)));
        wait_for_len(&sub, 2).await;
        assert_eq!(
            harness.cache.get("orders"),
            Some(json!([{"id": "1", "total": 10}]))
        );

        let snapshot = sub.refresh().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(sub.snapshot().len(), 2);

        // Later changes to the unpersisted record still land
        harness
            .transport
            .push("orders", ChangeFeedPayload::update("orders", &order("2", 25)));
        let mut snapshots = sub.snapshots();
        let snapshot = snapshots
            .wait_for(|snapshot| {
                snapshot
                    .get(&RecordId::new("2"))
                    .and_then(|record| record.get("total"))
                    == Some(&json!(25))
            })
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.len(), 2);

        // Once writes work again a refresh catches the cache up
        backend.fail_writes.store(false, Ordering::SeqCst);
        let snapshot = sub.refresh().await.unwrap();
        assert_eq!(harness.cache.get("orders"), Some(snapshot.to_value()));
    }

    #[tokio::test]
    async fn overlapping_refreshes_are_newest_wins() {
        let harness = Harness::new();
        let transport = Arc::new(GatedSnapshots::default());
        let first_gate = transport.gate();
        let second_gate = transport.gate();
        let sub = Arc::new(StreamSubscription::spawn(
            "orders",
            None,
            fast_options(),
            harness.ctx_with(transport.clone()),
        ));

        let first = tokio::spawn({
            let sub = sub.clone();
            async move { sub.refresh().await }
        });
        transport.wait_for_fetches(1).await;
        let second = tokio::spawn({
            let sub = sub.clone();
            async move { sub.refresh().await }
        });
        transport.wait_for_fetches(0).await;

        let _ = first_gate.send(vec![order("1", 10)]);
        assert_eq!(first.await.unwrap(), Err(SyncError::Cancelled));

        second_gate
            .send(vec![order("2", 20), order("3", 30)])
            .unwrap();
        let snapshot = second.await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.contains(&RecordId::new("1")));
        assert_eq!(sub.snapshot(), snapshot);
        assert_eq!(harness.cache.get("orders"), Some(snapshot.to_value()));
        assert!(!sub.is_loading());
    }

    #[tokio::test]
    async fn refreshes_on_separate_subscriptions_do_not_cancel_each_other() {
        let harness = Harness::new();
        let transport = Arc::new(GatedSnapshots::default());
        let gate_a = transport.gate();
        let gate_b = transport.gate();
        let a = Arc::new(StreamSubscription::spawn(
            "orders",
            None,
            fast_options(),
            harness.ctx_with(transport.clone()),
        ));
        let b = Arc::new(StreamSubscription::spawn(
            "orders",
            None,
            fast_options(),
            harness.ctx_with(transport.clone()),
        ));

        let pending_a = tokio::spawn({
            let a = a.clone();
            async move { a.refresh().await }
        });
        transport.wait_for_fetches(1).await;
        let pending_b = tokio::spawn({
            let b = b.clone();
            async move { b.refresh().await }
        });
        transport.wait_for_fetches(0).await;

        gate_b.send(vec![order("2", 20)]).unwrap();
        assert!(pending_b.await.unwrap().is_ok());

        gate_a
            .send(vec![order("1", 10)])
            .expect("first refresh was cancelled");
        let snapshot = pending_a.await.unwrap().unwrap();
        assert!(snapshot.contains(&RecordId::new("1")));
    }

    #[tokio::test]
    async fn adopts_cache_writes_from_other_consumers() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        harness
            .cache
            .set("orders", &json!([{"id": "5", "total": 50}]));
        let snapshot = wait_for_len(&sub, 1).await;
        assert!(snapshot.contains(&RecordId::new("5")));

        // Unrelated keys are ignored
        harness.cache.set("clients", &json!([{"id": "c"}]));
        tokio::task::yield_now().await;
        assert_eq!(sub.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn dropping_handle_stops_actor() {
        let harness = Harness::new();
        let sub = harness.spawn(fast_options());
        let mut statuses = sub.statuses();
        wait_for_state(&sub, SubscriptionState::Subscribed).await;

        drop(sub);
        statuses
            .wait_for(|status| status.state == SubscriptionState::Idle)
            .await
            .ok();
        assert_eq!(statuses.borrow().state, SubscriptionState::Idle);
        assert!(harness.operations.live_lanes().is_empty());
    }
}
