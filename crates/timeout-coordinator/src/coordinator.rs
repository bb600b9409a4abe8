//! Shared timeout coordinator.

use crate::{ClearFn, TimeoutForest, TimeoutId};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// Thread-safe handle over a [`TimeoutForest`] that also owns the timers.
///
/// Cheap to clone; clones share the same forest. Clear functions always run
/// after the forest lock is released, so they may call back into the
/// coordinator.
#[derive(Clone, Default)]
pub struct TimeoutCoordinator {
    forest: Arc<Mutex<TimeoutForest>>,
}

impl TimeoutCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimeoutForest> {
        self.forest.lock().expect("lock poisoned")
    }

    /// Register a node with a clear function.
    pub fn register<F>(&self, id: TimeoutId, clear_fn: F, parent: Option<&TimeoutId>)
    where
        F: FnOnce() + Send + 'static,
    {
        let displaced = self.lock().register(id, Some(Box::new(clear_fn)), parent);
        run_clear_fns(displaced);
    }

    /// Register a grouping node with nothing to clear of its own.
    pub fn register_scope(&self, id: TimeoutId, parent: Option<&TimeoutId>) {
        let displaced = self.lock().register(id, None, parent);
        run_clear_fns(displaced);
    }

    /// Forget a node without clearing it. Children become roots.
    pub fn unregister(&self, id: &TimeoutId) -> bool {
        self.lock().unregister(id)
    }

    /// Clear a node and its whole subtree. Returns how many nodes were removed
    /// that carried a clear function.
    pub fn clear_subtree(&self, id: &TimeoutId) -> usize {
        let cleared = self.lock().clear_subtree(id);
        let count = cleared.len();
        if count > 0 {
            debug!(timeout_id = %id, cleared = count, "Cleared timeout subtree");
        }
        run_clear_fns(cleared);
        count
    }

    /// Cancel a single timer (and anything chained under it).
    pub fn clear(&self, id: &TimeoutId) -> usize {
        self.clear_subtree(id)
    }

    /// Clear every registered node.
    pub fn clear_all(&self) -> usize {
        let cleared = self.lock().clear_all();
        let count = cleared.len();
        run_clear_fns(cleared);
        count
    }

    pub fn contains(&self, id: &TimeoutId) -> bool {
        self.lock().contains(id)
    }

    pub fn has_children(&self, id: &TimeoutId) -> bool {
        self.lock().has_children(id)
    }

    pub fn children(&self, id: &TimeoutId) -> Vec<TimeoutId> {
        self.lock().children(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Start a timer that runs `on_fire` after `delay`.
    ///
    /// The timer is registered under `parent` (or as a root) before it is
    /// spawned. It fires at most once, only while its node is still
    /// registered, and never after it has been cleared. Firing removes the
    /// node; its children survive as roots. Must be called within a tokio
    /// runtime.
    pub fn start_timeout<F>(
        &self,
        delay: Duration,
        on_fire: F,
        parent: Option<&TimeoutId>,
    ) -> TimeoutId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TimeoutId::generate("timeout");
        let displaced = self.lock().register(id.clone(), None, parent);
        run_clear_fns(displaced);

        let forest = self.forest.clone();
        let fire_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = forest.lock().expect("lock poisoned").unregister(&fire_id);
            if claimed {
                trace!(timeout_id = %fire_id, "Timeout fired");
                on_fire();
            }
        });

        let abort = handle.abort_handle();
        let clear_fn: ClearFn = Box::new(move || abort.abort());
        if self.lock().set_clear_fn(&id, clear_fn).is_err() {
            // Already fired or cleared
            handle.abort();
        }

        trace!(timeout_id = %id, delay_ms = delay.as_millis() as u64, "Timeout scheduled");
        id
    }

    /// Clear everything. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let count = self.clear_all();
        debug!(cleared = count, "Timeout coordinator shut down");
    }
}

impl std::fmt::Debug for TimeoutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutCoordinator")
            .field("nodes", &self.len())
            .finish()
    }
}

fn run_clear_fns(fns: Vec<ClearFn>) {
    for clear_fn in fns {
        clear_fn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let make = move || -> Box<dyn FnOnce() + Send> {
            let count = handle.clone();
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    /// Let spawned timer tasks observe the advanced clock.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once_after_delay() {
        let coordinator = TimeoutCoordinator::new();
        let (fired, on_fire) = counter();

        let id = coordinator.start_timeout(Duration::from_millis(500), on_fire(), None);
        assert!(coordinator.contains(&id));

        tokio::time::advance(Duration::from_millis(499)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!coordinator.contains(&id));

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timer_never_fires() {
        let coordinator = TimeoutCoordinator::new();
        let (fired, on_fire) = counter();

        let id = coordinator.start_timeout(Duration::from_millis(100), on_fire(), None);
        assert_eq!(coordinator.clear(&id), 1);
        assert_eq!(coordinator.clear(&id), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_parent_cancels_nested_timers() {
        let coordinator = TimeoutCoordinator::new();
        let (fired, on_fire) = counter();

        let p = TimeoutId::new("p");
        coordinator.register_scope(p.clone(), None);
        let c1 = coordinator.start_timeout(Duration::from_millis(100), on_fire(), Some(&p));
        let c2 = coordinator.start_timeout(Duration::from_millis(200), on_fire(), Some(&p));
        let c3 = coordinator.start_timeout(Duration::from_millis(300), on_fire(), Some(&c2));
        assert_eq!(coordinator.children(&p), vec![c1.clone(), c2.clone()]);

        coordinator.clear_subtree(&p);

        for id in [&p, &c1, &c2, &c3] {
            assert!(!coordinator.contains(id));
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_parent_leaves_children_running() {
        let coordinator = TimeoutCoordinator::new();
        let (fired, on_fire) = counter();

        let parent = coordinator.start_timeout(Duration::from_millis(100), on_fire(), None);
        let child = coordinator.start_timeout(Duration::from_millis(200), on_fire(), Some(&parent));

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(coordinator.contains(&child));

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(coordinator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_fn_may_reenter_coordinator() {
        let coordinator = TimeoutCoordinator::new();
        let reentrant = coordinator.clone();
        coordinator.register(
            "outer".into(),
            move || reentrant.register_scope("registered-from-clear".into(), None),
            None,
        );

        coordinator.clear_subtree(&"outer".into());
        assert!(coordinator.contains(&"registered-from-clear".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent() {
        let coordinator = TimeoutCoordinator::new();
        let (fired, on_fire) = counter();
        coordinator.start_timeout(Duration::from_millis(10), on_fire(), None);
        coordinator.start_timeout(Duration::from_millis(20), on_fire(), None);

        coordinator.shutdown();
        coordinator.shutdown();

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(coordinator.is_empty());
    }
}
