//! WebSocket change-feed protocol frames.

use change_reconciler::{ChangeFeedPayload, Record};
use serde::{Deserialize, Serialize};

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe { resource: String },
    Unsubscribe { resource: String },
    Heartbeat,
}

impl ClientFrame {
    pub fn subscribe(resource: &str) -> Self {
        Self::Subscribe {
            resource: resource.to_string(),
        }
    }

    pub fn unsubscribe(resource: &str) -> Self {
        Self::Unsubscribe {
            resource: resource.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Subscription acknowledged.
    Subscribed { resource: String },
    Change {
        resource: String,
        payload: ChangeFeedPayload,
    },
    Snapshot {
        resource: String,
        records: Vec<Record>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
        error: String,
    },
    /// Any frame type this client does not know.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Resource the frame concerns, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            ServerFrame::Subscribed { resource }
            | ServerFrame::Change { resource, .. }
            | ServerFrame::Snapshot { resource, .. } => Some(resource),
            ServerFrame::Error { resource, .. } => resource.as_deref(),
            ServerFrame::Unknown => None,
        }
    }
}
