//! In-process change feed.

use crate::transport::FEED_CHANNEL_CAPACITY;
use crate::{ChangeFeedTransport, FeedMessage, TransportError, TransportResult};
use async_trait::async_trait;
use change_reconciler::{ChangeFeedPayload, Record};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Default)]
struct MemoryFeeds {
    subscribers: HashMap<String, Vec<mpsc::Sender<FeedMessage>>>,
    failures: HashMap<String, u32>,
    stalled: HashMap<String, bool>,
    snapshots: HashMap<String, Vec<Record>>,
    subscribe_calls: HashMap<String, u32>,
}

/// Change feed living in process memory.
///
/// Tests and demos drive it directly: push changes, inject subscribe
/// failures, or drop every open feed for a resource to simulate a lost
/// connection. Cheap to clone; clones share the same feeds.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    feeds: Arc<Mutex<MemoryFeeds>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFeeds> {
        self.feeds.lock().expect("lock poisoned")
    }

    /// Deliver a change to every open feed for `resource`. Returns how many
    /// feeds accepted it.
    pub fn push(&self, resource: &str, payload: ChangeFeedPayload) -> usize {
        self.push_message(resource, FeedMessage::Change(payload))
    }

    pub fn push_message(&self, resource: &str, message: FeedMessage) -> usize {
        let mut feeds = self.lock();
        let Some(senders) = feeds.subscribers.get_mut(resource) else {
            return 0;
        };
        senders.retain(|sender| !sender.is_closed());

        let mut delivered = 0;
        for sender in senders.iter() {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(resource = %resource, error = %err, "Dropping feed message"),
            }
        }
        delivered
    }

    /// Make the next `count` subscribe calls for `resource` fail.
    pub fn fail_subscribes(&self, resource: &str, count: u32) {
        self.lock().failures.insert(resource.to_string(), count);
    }

    /// Make subscribe calls for `resource` hang until unstalled.
    pub fn stall_subscribes(&self, resource: &str, stalled: bool) {
        self.lock().stalled.insert(resource.to_string(), stalled);
    }

    /// Close every open feed for `resource`.
    pub fn disconnect(&self, resource: &str) -> usize {
        let dropped = self
            .lock()
            .subscribers
            .remove(resource)
            .map(|senders| senders.len())
            .unwrap_or(0);
        debug!(resource = %resource, dropped, "Memory feeds disconnected");
        dropped
    }

    /// Records served by `fetch_snapshot`.
    pub fn set_snapshot(&self, resource: &str, records: Vec<Record>) {
        self.lock().snapshots.insert(resource.to_string(), records);
    }

    /// Number of open feeds for `resource`.
    pub fn subscriber_count(&self, resource: &str) -> usize {
        self.lock()
            .subscribers
            .get(resource)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of subscribe calls seen for `resource`, including failed ones.
    pub fn subscribe_calls(&self, resource: &str) -> u32 {
        self.lock().subscribe_calls.get(resource).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ChangeFeedTransport for MemoryTransport {
    async fn subscribe(&self, resource: &str) -> TransportResult<mpsc::Receiver<FeedMessage>> {
        let stalled = {
            let mut feeds = self.lock();
            *feeds.subscribe_calls.entry(resource.to_string()).or_default() += 1;

            if let Some(remaining) = feeds.failures.get_mut(resource) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Connection(format!(
                        "subscribe to {resource} refused"
                    )));
                }
            }
            feeds.stalled.get(resource).copied().unwrap_or(false)
        };

        if stalled {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        self.lock()
            .subscribers
            .entry(resource.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn fetch_snapshot(&self, resource: &str) -> TransportResult<Option<Vec<Record>>> {
        Ok(self.lock().snapshots.get(resource).cloned())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let feeds = self.lock();
        f.debug_struct("MemoryTransport")
            .field("resources", &feeds.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}
