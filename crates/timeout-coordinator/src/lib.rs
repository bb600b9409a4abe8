//! Hierarchical timeout registry.
//!
//! Timers are registered as nodes in a forest: a node may have a parent, and
//! clearing a node clears its whole subtree (children first). This lets an
//! operation cancel its own timeout together with any follow-up timers that
//! were chained under it.
//!
//! ```text
//! op-scope
//! ├── timeout (redirect after 10s)
//! │   └── toast (after 2s)
//! └── retry (after 500ms)
//! ```
//!
//! [`TimeoutForest`] is the synchronous arena; [`TimeoutCoordinator`] wraps it
//! for shared use and spawns the actual tokio timers.

mod coordinator;
mod forest;
mod id;

pub use coordinator::TimeoutCoordinator;
pub use forest::{ClearFn, TimeoutForest};
pub use id::TimeoutId;
