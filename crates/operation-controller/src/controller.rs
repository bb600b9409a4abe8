//! Lane registry.

use crate::{ConsumerScope, Lane, OperationToken};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use timeout_coordinator::{TimeoutCoordinator, TimeoutId};
use tokio::sync::watch;
use tracing::debug;

struct LiveOperation {
    generation: u64,
    cancel: watch::Sender<bool>,
    scope: TimeoutId,
}

#[derive(Default)]
struct Lanes {
    live: HashMap<Lane, LiveOperation>,
    next_generation: u64,
}

pub(crate) struct Inner {
    lanes: Mutex<Lanes>,
    timeouts: TimeoutCoordinator,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().expect("lock poisoned")
    }

    pub(crate) fn is_live(&self, token: &OperationToken) -> bool {
        self.lock()
            .live
            .get(&token.lane)
            .is_some_and(|op| op.generation == token.generation)
    }

    /// Remove the lane entry if it still belongs to `generation`.
    fn take_if_current(&self, lane: &Lane, generation: u64) -> Option<LiveOperation> {
        let mut lanes = self.lock();
        match lanes.live.get(lane) {
            Some(op) if op.generation == generation => lanes.live.remove(lane),
            _ => None,
        }
    }

    fn retire(&self, lane: &Lane, op: LiveOperation, reason: &'static str) {
        let _ = op.cancel.send(true);
        self.timeouts.clear_subtree(&op.scope);
        debug!(lane = %lane, generation = op.generation, reason, "Operation cancelled");
    }
}

/// Registry of live operations, one per lane.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct OperationController {
    inner: Arc<Inner>,
}

impl OperationController {
    pub fn new(timeouts: TimeoutCoordinator) -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(Lanes::default()),
                timeouts,
            }),
        }
    }

    pub fn timeouts(&self) -> &TimeoutCoordinator {
        &self.inner.timeouts
    }

    /// Issue a fresh token for `lane`, cancelling the previous one.
    pub fn new_token(&self, lane: impl Into<Lane>) -> OperationToken {
        let lane = lane.into();
        let scope = TimeoutId::generate(&format!("op:{lane}"));
        self.inner.timeouts.register_scope(scope.clone(), None);

        let (cancel, cancelled) = watch::channel(false);
        let (generation, previous) = {
            let mut lanes = self.inner.lock();
            lanes.next_generation += 1;
            let generation = lanes.next_generation;
            let previous = lanes.live.insert(
                lane.clone(),
                LiveOperation {
                    generation,
                    cancel,
                    scope: scope.clone(),
                },
            );
            (generation, previous)
        };

        if let Some(previous) = previous {
            self.inner.retire(&lane, previous, "superseded");
        }
        debug!(lane = %lane, generation, "Operation started");

        OperationToken {
            lane,
            generation,
            scope,
            cancelled,
            controller: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_live(&self, token: &OperationToken) -> bool {
        self.inner.is_live(token)
    }

    /// Mark the operation finished and free its lane.
    ///
    /// No-op for a stale token, so a superseding operation is never touched.
    /// Timers started under the token are cleared.
    pub fn complete(&self, token: &OperationToken) -> bool {
        let Some(op) = self.inner.take_if_current(&token.lane, token.generation) else {
            return false;
        };
        self.inner.timeouts.clear_subtree(&op.scope);
        debug!(lane = %token.lane, generation = op.generation, "Operation completed");
        true
    }

    /// Cancel `token` if it is still current. Returns whether it was.
    pub fn cancel(&self, token: &OperationToken) -> bool {
        match self.inner.take_if_current(&token.lane, token.generation) {
            Some(op) => {
                self.inner.retire(&token.lane, op, "cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel whatever operation is live on `lane`.
    pub fn cancel_lane(&self, lane: &Lane) -> bool {
        let removed = self.inner.lock().live.remove(lane);
        match removed {
            Some(op) => {
                self.inner.retire(lane, op, "lane cancelled");
                true
            }
            None => false,
        }
    }

    /// Start a timer owned by `token`. Returns `None` if the token is no longer
    /// live. The timer is cleared when the token completes or is cancelled.
    pub fn start_timeout<F>(
        &self,
        token: &OperationToken,
        delay: Duration,
        on_fire: F,
    ) -> Option<TimeoutId>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_live(token) {
            return None;
        }
        Some(
            self.inner
                .timeouts
                .start_timeout(delay, on_fire, Some(&token.scope)),
        )
    }

    /// Open a consumer scope that tracks every token it issues.
    pub fn scope(&self) -> ConsumerScope {
        ConsumerScope::new(self.clone())
    }

    /// Lanes with a live operation.
    pub fn live_lanes(&self) -> Vec<Lane> {
        let mut lanes: Vec<Lane> = self.inner.lock().live.keys().cloned().collect();
        lanes.sort();
        lanes
    }

    /// Cancel every live operation.
    pub fn shutdown(&self) {
        let drained: Vec<(Lane, LiveOperation)> = self.inner.lock().live.drain().collect();
        for (lane, op) in drained {
            self.inner.retire(&lane, op, "shutdown");
        }
    }
}

impl std::fmt::Debug for OperationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationController")
            .field("live_lanes", &self.live_lanes())
            .finish()
    }
}
