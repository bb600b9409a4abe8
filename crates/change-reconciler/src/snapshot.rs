//! Immutable collection snapshots and the reconciliation fold.

use crate::{Change, ChangeEvent, ReconcileError, ReconcileResult, Record, RecordId};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// An immutable, shareable view of a collection.
///
/// Logically a map keyed by record id (no duplicates), kept as a vector so
/// consumers get a stable ordering: records keep their insertion position and
/// new inserts are appended.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Arc<Vec<Record>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot, keeping the last occurrence of any duplicated id at
    /// the position of its first occurrence.
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut deduped: Vec<Record> = Vec::with_capacity(records.len());
        for record in records {
            match deduped.iter_mut().find(|existing| existing.id == record.id) {
                Some(existing) => *existing = record,
                None => deduped.push(record),
            }
        }
        Self {
            records: Arc::new(deduped),
        }
    }

    /// Decode a snapshot from its persisted JSON array form.
    pub fn from_value(value: Value) -> ReconcileResult<Self> {
        let Value::Array(items) = value else {
            return Err(ReconcileError::InvalidSnapshot(
                "expected a JSON array of records".to_string(),
            ));
        };
        let records = items
            .into_iter()
            .map(Record::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_records(records))
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.records.iter().map(Record::to_value).collect())
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|record| &record.id == id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> HashSet<&RecordId> {
        self.records.iter().map(|record| &record.id).collect()
    }

    /// Whether both snapshots share the same allocation.
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.records, &other.records)
    }

    /// Apply one event, returning the next snapshot.
    pub fn apply(&self, event: &ChangeEvent) -> Snapshot {
        apply(self, event)
    }
}

/// Value equality: same records in the same order.
impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.records == other.records
    }
}

/// Fold one change event onto a snapshot.
///
/// - Insert of an existing id is a no-op (duplicate delivery).
/// - Update of an unknown id is a no-op (no record is synthesized from a
///   partial update); otherwise the record is replaced wholesale.
/// - Delete of an unknown id is a no-op.
///
/// A no-op returns a clone sharing the input allocation; an effective change
/// returns a fresh allocation.
pub fn apply(snapshot: &Snapshot, event: &ChangeEvent) -> Snapshot {
    match &event.change {
        Change::Insert(record) => {
            if snapshot.contains(&record.id) {
                trace!(record_id = %record.id, "Duplicate insert ignored");
                return snapshot.clone();
            }
            let mut next = Vec::with_capacity(snapshot.len() + 1);
            next.extend(snapshot.records.iter().cloned());
            next.push(record.clone());
            Snapshot {
                records: Arc::new(next),
            }
        }
        Change::Update(record) => {
            let Some(position) = snapshot.records.iter().position(|r| r.id == record.id) else {
                trace!(record_id = %record.id, "Update for unknown record ignored");
                return snapshot.clone();
            };
            let mut next = snapshot.records.as_ref().clone();
            next[position] = record.clone();
            Snapshot {
                records: Arc::new(next),
            }
        }
        Change::Delete(id) => {
            if !snapshot.contains(id) {
                trace!(record_id = %id, "Delete for unknown record ignored");
                return snapshot.clone();
            }
            let next: Vec<Record> = snapshot
                .records
                .iter()
                .filter(|record| &record.id != id)
                .cloned()
                .collect();
            Snapshot {
                records: Arc::new(next),
            }
        }
    }
}

/// Fold a batch of events in order.
pub fn apply_all<'a>(
    snapshot: &Snapshot,
    events: impl IntoIterator<Item = &'a ChangeEvent>,
) -> Snapshot {
    events
        .into_iter()
        .fold(snapshot.clone(), |acc, event| apply(&acc, event))
}
