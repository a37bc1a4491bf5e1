//! A single-shot promise with lock-free callback registration.
//!
//! A [`Promise`] is created with [`Promise::of`], which hands a producer two
//! capabilities: [`Resolve`] and [`Reject`]. The producer settles the promise
//! once, from any thread. Success and failure callbacks may be subscribed from
//! any thread at any time and each runs exactly once with the outcome.
//!
//! ```
//! use promise_cell::Promise;
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(None));
//! let sink = seen.clone();
//!
//! Promise::<&str, String>::of(|resolve, _reject| {
//!     resolve.resolve("🍓").expect("promise settled twice");
//!     Ok(())
//! })
//! .subscribe_success(move |value| *sink.lock().unwrap() = Some(*value));
//!
//! assert_eq!(*seen.lock().unwrap(), Some("🍓"));
//! ```
mod options;
mod promise;
pub mod registry;

pub use options::{CallbackPanics, Options};
pub use promise::{Panicked, Promise, Reject, Resolve, State};

use thiserror::Error;

/// Misuse of a promise's capabilities.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("promise already {state}")]
    AlreadyCompleted { state: State },
}
