//! WebSocket change-feed transport.

use crate::transport::FEED_CHANNEL_CAPACITY;
use crate::{
    ChangeFeedTransport, ClientFrame, FeedMessage, ServerFrame, TransportError, TransportResult,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Feed endpoint (e.g., ws://127.0.0.1:4000/changes).
    pub url: Url,
    /// How long to wait for the SUBSCRIBED acknowledgement.
    pub handshake_timeout: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
}

impl WebSocketConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Change feed over a WebSocket, one connection per subscription.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Connect and wait for the server to acknowledge `resource`.
    async fn handshake(&self, resource: &str) -> TransportResult<(WsWriter, WsReader)> {
        info!(url = %self.config.url, resource = %resource, "Connecting to change feed");
        let (ws_stream, _) = connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = ClientFrame::subscribe(resource).to_json()?;
        write.send(Message::Text(subscribe.into())).await?;
        debug!(resource = %resource, "Sent SUBSCRIBE");

        while let Some(msg_result) = read.next().await {
            match msg_result? {
                Message::Text(text) => match ServerFrame::from_json(&text) {
                    Ok(ServerFrame::Subscribed { resource: acked }) if acked == resource => {
                        return Ok((write, read));
                    }
                    Ok(ServerFrame::Error { error, .. }) => {
                        return Err(TransportError::Rejected(error));
                    }
                    Ok(other) => debug!(frame = ?other, "Ignoring frame during handshake"),
                    Err(e) => warn!(error = %e, "Failed to parse feed frame"),
                },
                Message::Ping(data) => write.send(Message::Pong(data)).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(TransportError::Connection(
            "connection closed before subscription was acknowledged".to_string(),
        ))
    }
}

#[async_trait]
impl ChangeFeedTransport for WebSocketTransport {
    async fn subscribe(&self, resource: &str) -> TransportResult<mpsc::Receiver<FeedMessage>> {
        let timeout = self.config.handshake_timeout;
        let (write, read) = tokio::time::timeout(timeout, self.handshake(resource))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(timeout))??;
        info!(resource = %resource, "Change feed subscribed");

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        tokio::spawn(pump_feed(
            resource.to_string(),
            write,
            read,
            tx,
            self.config.heartbeat_interval,
        ));
        Ok(rx)
    }
}

/// Forward frames for `resource` into `tx` until either side goes away.
async fn pump_feed(
    resource: String,
    mut write: WsWriter,
    mut read: WsReader,
    tx: mpsc::Sender<FeedMessage>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = interval(heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(resource = %resource, "Feed receiver dropped; unsubscribing");
                if let Ok(json) = ClientFrame::unsubscribe(&resource).to_json() {
                    let _ = write.send(Message::Text(json.into())).await;
                }
                let _ = write.close().await;
                return;
            }
            _ = heartbeat.tick() => {
                if let Ok(json) = ClientFrame::Heartbeat.to_json() {
                    if write.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            msg_result = read.next() => {
                let Some(msg_result) = msg_result else {
                    break;
                };
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let message = match ServerFrame::from_json(&text) {
                            Ok(frame) if frame.resource().is_some_and(|r| r != resource) => continue,
                            Ok(ServerFrame::Change { payload, .. }) => FeedMessage::Change(payload),
                            Ok(ServerFrame::Snapshot { records, .. }) => FeedMessage::Snapshot(records),
                            Ok(ServerFrame::Error { error, .. }) => FeedMessage::Error(error),
                            Ok(other) => {
                                debug!(frame = ?other, "Ignoring feed frame");
                                continue;
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to parse feed frame");
                                continue;
                            }
                        };
                        if tx.send(message).await.is_err() {
                            let _ = write.close().await;
                            return;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => {
                        info!(resource = %resource, "Change feed closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(resource = %resource, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }
    // Dropping tx tells the subscription the feed is gone
    debug!(resource = %resource, "Change feed pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn config_defaults() {
        let config = WebSocketConfig::new(Url::parse("ws://127.0.0.1:4000/changes").unwrap());
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/changes")).unwrap();
        let transport = WebSocketTransport::new(WebSocketConfig::new(url));
        assert!(transport.subscribe("orders").await.is_err());
    }

    #[tokio::test]
    async fn silent_server_hits_handshake_timeout() {
        // Accepts TCP but never completes the WebSocket upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let url = Url::parse(&format!("ws://{addr}/changes")).unwrap();
        let mut config = WebSocketConfig::new(url);
        config.handshake_timeout = Duration::from_millis(200);
        let transport = WebSocketTransport::new(config);

        let err = transport.subscribe("orders").await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn subscribes_and_forwards_changes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected SUBSCRIBE frame");
            };
            let frame: ClientFrame = serde_json::from_str(&text).unwrap();
            assert_eq!(frame, ClientFrame::subscribe("orders"));

            let frames = [
                r#"{"type":"SUBSCRIBED","resource":"orders"}"#,
                r#"{"type":"CHANGE","resource":"clients","payload":{"eventType":"DELETE","old":{"id":"9"}}}"#,
                r#"{"type":"CHANGE","resource":"orders","payload":{"eventType":"INSERT","new":{"id":"1","total":10}}}"#,
            ];
            for frame in frames {
                ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            }
            let _ = ws.close(None).await;
        });

        let url = Url::parse(&format!("ws://{addr}/changes")).unwrap();
        let transport = WebSocketTransport::new(WebSocketConfig::new(url));
        let mut feed = transport.subscribe("orders").await.unwrap();

        match feed.recv().await {
            Some(FeedMessage::Change(payload)) => {
                assert_eq!(payload.event_type, change_reconciler::ChangeKind::Insert);
            }
            other => panic!("expected change, got {:?}", other),
        }
        // Server closed the socket
        assert_eq!(feed.recv().await, None);
        server.await.unwrap();
    }
}
