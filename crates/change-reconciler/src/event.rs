//! Change events and their wire representation.

use crate::{ReconcileError, ReconcileResult, Record, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change-feed event as delivered by the remote collaborator.
///
/// `new` is populated for INSERT/UPDATE; for DELETE only `old.id` is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedPayload {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

impl ChangeFeedPayload {
    pub fn insert(table: &str, record: &Record) -> Self {
        Self::with_rows(ChangeKind::Insert, table, Some(record.to_value()), None)
    }

    pub fn update(table: &str, record: &Record) -> Self {
        Self::with_rows(ChangeKind::Update, table, Some(record.to_value()), None)
    }

    pub fn delete(table: &str, id: &RecordId) -> Self {
        Self::with_rows(
            ChangeKind::Delete,
            table,
            None,
            Some(serde_json::json!({ "id": id.as_str() })),
        )
    }

    fn with_rows(kind: ChangeKind, table: &str, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            event_type: kind,
            table: table.to_string(),
            schema: "public".to_string(),
            new,
            old,
            commit_timestamp: None,
        }
    }
}

/// The effective mutation carried by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert(Record),
    Update(Record),
    Delete(RecordId),
}

/// A validated change event.
///
/// `sequence` is an opaque, transport-provided ordering hint; it is carried
/// through but not interpreted by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub change: Change,
    pub sequence: Option<String>,
}

impl ChangeEvent {
    pub fn insert(record: Record) -> Self {
        Self {
            change: Change::Insert(record),
            sequence: None,
        }
    }

    pub fn update(record: Record) -> Self {
        Self {
            change: Change::Update(record),
            sequence: None,
        }
    }

    pub fn delete(id: impl Into<RecordId>) -> Self {
        Self {
            change: Change::Delete(id.into()),
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    pub fn kind(&self) -> ChangeKind {
        match &self.change {
            Change::Insert(_) => ChangeKind::Insert,
            Change::Update(_) => ChangeKind::Update,
            Change::Delete(_) => ChangeKind::Delete,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        match &self.change {
            Change::Insert(record) | Change::Update(record) => &record.id,
            Change::Delete(id) => id,
        }
    }

    /// Parse and validate a raw change-feed JSON document.
    pub fn from_json(raw: &str) -> ReconcileResult<Self> {
        let payload: ChangeFeedPayload = serde_json::from_str(raw)?;
        Self::try_from(payload)
    }
}

impl TryFrom<ChangeFeedPayload> for ChangeEvent {
    type Error = ReconcileError;

    fn try_from(payload: ChangeFeedPayload) -> Result<Self, Self::Error> {
        let kind = payload.event_type;
        let malformed = |reason: &str| ReconcileError::MalformedEvent {
            kind: kind.as_str(),
            reason: reason.to_string(),
        };

        let change = match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let row = payload
                    .new
                    .filter(|row| !row.is_null())
                    .ok_or_else(|| malformed("missing `new` record"))?;
                let record = Record::from_value(row)
                    .map_err(|err| malformed(&format!("invalid `new` record: {err}")))?;
                if kind == ChangeKind::Insert {
                    Change::Insert(record)
                } else {
                    Change::Update(record)
                }
            }
            ChangeKind::Delete => {
                let id = payload
                    .old
                    .as_ref()
                    .and_then(|old| old.get("id"))
                    .and_then(RecordId::from_json)
                    .ok_or_else(|| malformed("missing `old.id`"))?;
                Change::Delete(id)
            }
        };

        Ok(ChangeEvent {
            change,
            sequence: payload.commit_timestamp,
        })
    }
}
