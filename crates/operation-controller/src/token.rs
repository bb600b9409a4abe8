//! Lanes and cancellation tokens.

use crate::controller::Inner;
use crate::{OperationError, OperationResult};
use std::fmt;
use std::future::Future;
use std::sync::Weak;
use timeout_coordinator::TimeoutId;
use tokio::sync::watch;

/// Logical operation identifier. At most one operation is live per lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lane(String);

impl Lane {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Lane {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Lane {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Handle on one operation.
///
/// A token stops being live when a newer token is issued on its lane, when it
/// completes, or when its lane or owning scope is cancelled.
#[derive(Clone)]
pub struct OperationToken {
    pub(crate) lane: Lane,
    pub(crate) generation: u64,
    pub(crate) scope: TimeoutId,
    pub(crate) cancelled: watch::Receiver<bool>,
    pub(crate) controller: Weak<Inner>,
}

impl OperationToken {
    pub fn lane(&self) -> &Lane {
        &self.lane
    }

    /// Timeout scope node owned by this operation.
    pub fn scope_id(&self) -> &TimeoutId {
        &self.scope
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Whether this is still the current operation on its lane.
    pub fn is_live(&self) -> bool {
        match self.controller.upgrade() {
            Some(inner) => inner.is_live(self),
            None => false,
        }
    }

    /// Resolves once cancellation is signalled. Never resolves for a token
    /// that completes normally.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `future`, failing with [`OperationError::Cancelled`] if the token
    /// is cancelled first or is no longer live once the future finishes.
    pub async fn guard<F>(&self, future: F) -> OperationResult<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.cancelled_error()),
            output = future => {
                if self.is_live() {
                    Ok(output)
                } else {
                    Err(self.cancelled_error())
                }
            }
        }
    }

    /// A token that is cancelled from birth and never registered on its lane.
    pub(crate) fn detached_cancelled(lane: Lane) -> Self {
        let (_cancel, cancelled) = watch::channel(true);
        Self {
            scope: TimeoutId::generate(&format!("op:{lane}")),
            lane,
            generation: 0,
            cancelled,
            controller: Weak::new(),
        }
    }

    pub(crate) fn cancelled_error(&self) -> OperationError {
        OperationError::Cancelled {
            lane: self.lane.to_string(),
        }
    }
}

/// Two tokens are equal when they name the same operation.
impl PartialEq for OperationToken {
    fn eq(&self, other: &Self) -> bool {
        self.lane == other.lane && self.generation == other.generation
    }
}

impl Eq for OperationToken {}

impl fmt::Debug for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationToken")
            .field("lane", &self.lane)
            .field("generation", &self.generation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
