//! Newest-wins operation lanes.
//!
//! Request-driven operations ("check session", "authenticate", "refresh")
//! run on a named [`Lane`]. Starting a new operation on a lane cancels the
//! previous one, and every operation owns a timeout scope so the timers it
//! started die with it.
//!
//! Cancellation is cooperative: an in-flight call may still finish, but its
//! effects should be gated by [`OperationToken::is_live`] or run through
//! [`OperationToken::guard`].

mod controller;
mod error;
mod scope;
mod token;

pub use controller::OperationController;
pub use error::{OperationError, OperationResult};
pub use scope::ConsumerScope;
pub use token::{Lane, OperationToken};
