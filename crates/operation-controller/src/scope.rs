//! Per-consumer token ownership.

use crate::{Lane, OperationController, OperationToken};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Tracks the tokens one consumer has issued so they can all be cancelled
/// when the consumer goes away.
///
/// Teardown runs on drop as well; tearing down twice is a no-op.
pub struct ConsumerScope {
    controller: OperationController,
    issued: Mutex<Vec<OperationToken>>,
    torn_down: AtomicBool,
}

impl ConsumerScope {
    pub(crate) fn new(controller: OperationController) -> Self {
        Self {
            controller,
            issued: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Issue a token on `lane` owned by this scope.
    ///
    /// After teardown the token is born cancelled and the lane is left alone.
    pub fn new_token(&self, lane: impl Into<Lane>) -> OperationToken {
        let lane = lane.into();
        let mut issued = self.issued.lock().expect("lock poisoned");
        if self.is_torn_down() {
            debug!(lane = %lane, "Token requested on torn-down scope");
            return OperationToken::detached_cancelled(lane);
        }

        let token = self.controller.new_token(lane);
        issued.retain(|existing| existing.is_live());
        issued.push(token.clone());
        token
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Cancel every token this scope issued that is still live. Returns how
    /// many were cancelled.
    pub fn teardown(&self) -> usize {
        let issued = {
            let mut issued = self.issued.lock().expect("lock poisoned");
            if self.torn_down.swap(true, Ordering::SeqCst) {
                return 0;
            }
            std::mem::take(&mut *issued)
        };
        let cancelled = issued
            .iter()
            .filter(|token| self.controller.cancel(token))
            .count();
        debug!(cancelled, "Consumer scope torn down");
        cancelled
    }
}

impl Drop for ConsumerScope {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ConsumerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerScope")
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}
