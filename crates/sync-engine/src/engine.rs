//! The engine service object.

use crate::{EngineError, EngineResult, WatchHandle, WatchOptions};
use change_feed_subscription::{
    ChangeFeedTransport, RetryPolicy, StreamSubscription, SubscriptionContext,
    SubscriptionOptions, WebSocketConfig, WebSocketTransport,
};
use change_reconciler::Snapshot;
use local_cache::{FileBackend, LocalCache};
use operation_controller::{ConsumerScope, Lane, OperationController, OperationToken};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use sync_config_and_utils::{Config, Paths, ReconnectConfig};
use timeout_coordinator::{TimeoutCoordinator, TimeoutId};
use tokio::sync::watch;
use tracing::{debug, info};

/// Engine-wide subscription defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    fn subscription_defaults(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            max_retries: self.retry.max_attempts,
            initial_retry_delay: self.retry.initial_delay,
            max_retry_delay: self.retry.max_delay,
            jitter_ratio: self.retry.jitter_ratio,
            notify_on_change: false,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

fn retry_policy(reconnect: &ReconnectConfig) -> RetryPolicy {
    RetryPolicy {
        initial_delay: reconnect.initial_delay(),
        max_delay: reconnect.max_delay(),
        max_attempts: reconnect.max_attempts,
        jitter_ratio: reconnect.jitter_ratio,
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            retry: retry_policy(&config.reconnect),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    cache: LocalCache,
    transport: Arc<dyn ChangeFeedTransport>,
    timeouts: TimeoutCoordinator,
    operations: OperationController,
    online: watch::Sender<bool>,
    subscriptions: Mutex<HashMap<String, Weak<StreamSubscription>>>,
    shut_down: AtomicBool,
}

/// Entry point for consumers.
///
/// Owns the cache, the timeout forest, the operation lanes, and one shared
/// subscription per watched resource. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        cache: LocalCache,
        transport: Arc<dyn ChangeFeedTransport>,
    ) -> Self {
        let timeouts = TimeoutCoordinator::new();
        let operations = OperationController::new(timeouts.clone());
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(EngineInner {
                config,
                cache,
                transport,
                timeouts,
                operations,
                online,
                subscriptions: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Build an engine with a file-backed cache and the WebSocket transport.
    pub fn from_config(config: &Config, paths: &Paths) -> EngineResult<Self> {
        let cache_dir = config.cache_dir(paths);
        let cache = LocalCache::new(Arc::new(FileBackend::open(&cache_dir)?));

        let mut ws = WebSocketConfig::new(config.feed_url()?);
        ws.handshake_timeout = config.handshake_timeout();
        ws.heartbeat_interval = config.heartbeat_interval();
        info!(feed_url = %ws.url, cache_dir = %cache_dir.display(), "Sync engine configured");

        Ok(Self::new(
            EngineConfig::from(config),
            cache,
            Arc::new(WebSocketTransport::new(ws)),
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &LocalCache {
        &self.inner.cache
    }

    pub fn timeouts(&self) -> &TimeoutCoordinator {
        &self.inner.timeouts
    }

    pub fn operations(&self) -> &OperationController {
        &self.inner.operations
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Weak<StreamSubscription>>> {
        self.inner.subscriptions.lock().expect("lock poisoned")
    }

    /// Watch `resource`, starting a subscription unless one is already
    /// running. An existing subscription keeps its original options.
    ///
    /// Must be called within a tokio runtime.
    pub fn watch(
        &self,
        resource: &str,
        seed: Option<Snapshot>,
        options: WatchOptions,
    ) -> EngineResult<WatchHandle> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let mut subscriptions = self.subscriptions();
        subscriptions.retain(|_, subscription| subscription.strong_count() > 0);
        if let Some(existing) = subscriptions.get(resource).and_then(Weak::upgrade) {
            if !existing.is_closed() {
                debug!(resource = %resource, "Sharing existing subscription");
                return Ok(WatchHandle::new(existing));
            }
        }

        let options = options.resolve(&self.inner.config.subscription_defaults());
        let ctx = SubscriptionContext {
            transport: self.inner.transport.clone(),
            cache: self.inner.cache.clone(),
            operations: self.inner.operations.clone(),
            online: self.inner.online.subscribe(),
        };
        let subscription = Arc::new(StreamSubscription::spawn(resource, seed, options, ctx));
        subscriptions.insert(resource.to_string(), Arc::downgrade(&subscription));
        info!(resource = %resource, "Watching resource");
        Ok(WatchHandle::new(subscription))
    }

    /// Resources with a running subscription.
    pub fn watched_resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self
            .subscriptions()
            .iter()
            .filter(|(_, subscription)| subscription.strong_count() > 0)
            .map(|(resource, _)| resource.clone())
            .collect();
        resources.sort();
        resources
    }

    // Operations

    pub fn new_operation(&self, lane: impl Into<Lane>) -> OperationToken {
        self.inner.operations.new_token(lane)
    }

    pub fn is_live(&self, token: &OperationToken) -> bool {
        self.inner.operations.is_live(token)
    }

    pub fn complete(&self, token: &OperationToken) -> bool {
        self.inner.operations.complete(token)
    }

    pub fn cancel_lane(&self, lane: &Lane) -> bool {
        self.inner.operations.cancel_lane(lane)
    }

    pub fn scope(&self) -> ConsumerScope {
        self.inner.operations.scope()
    }

    // Timeouts

    pub fn start_timeout<F>(&self, delay: Duration, on_fire: F, parent: Option<&TimeoutId>) -> TimeoutId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.timeouts.start_timeout(delay, on_fire, parent)
    }

    /// Start a timer that dies with `token`.
    pub fn start_operation_timeout<F>(
        &self,
        token: &OperationToken,
        delay: Duration,
        on_fire: F,
    ) -> Option<TimeoutId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.operations.start_timeout(token, delay, on_fire)
    }

    pub fn clear(&self, id: &TimeoutId) -> usize {
        self.inner.timeouts.clear(id)
    }

    pub fn clear_subtree(&self, id: &TimeoutId) -> usize {
        self.inner.timeouts.clear_subtree(id)
    }

    // Connectivity

    /// Report host connectivity to every subscription.
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop every subscription, cancel every operation, and clear every
    /// timer. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscriptions: Vec<Arc<StreamSubscription>> = self
            .subscriptions()
            .drain()
            .filter_map(|(_, subscription)| subscription.upgrade())
            .collect();
        for subscription in &subscriptions {
            subscription.shutdown().await;
        }

        self.inner.operations.shutdown();
        self.inner.timeouts.shutdown();
        info!(subscriptions = subscriptions.len(), "Sync engine shut down");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("watched", &self.watched_resources())
            .field("online", &self.is_online())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
