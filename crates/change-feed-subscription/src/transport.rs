//! Transport abstraction for change feeds.

use crate::TransportResult;
use async_trait::async_trait;
use change_reconciler::{ChangeFeedPayload, Record};
use tokio::sync::mpsc;

/// Buffer size for per-subscription feed channels.
pub(crate) const FEED_CHANNEL_CAPACITY: usize = 256;

/// A message delivered on an open feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A row-level change.
    Change(ChangeFeedPayload),
    /// A full replacement of the collection.
    Snapshot(Vec<Record>),
    /// A server-side error that did not close the feed.
    Error(String),
}

/// Source of change events for named resources.
///
/// `subscribe` resolves once the server has acknowledged the subscription.
/// The returned channel yields messages in delivery order; the channel
/// closing means the feed was lost. Dropping the receiver unsubscribes.
#[async_trait]
pub trait ChangeFeedTransport: Send + Sync {
    async fn subscribe(&self, resource: &str) -> TransportResult<mpsc::Receiver<FeedMessage>>;

    /// Fetch the full current collection, if the transport supports it.
    async fn fetch_snapshot(&self, _resource: &str) -> TransportResult<Option<Vec<Record>>> {
        Ok(None)
    }
}
