//! Error types surfaced at the crate's fallible boundaries.

use thiserror::Error;

/// An error accessing or disposing part of the reactive graph.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// A signal, computed, or effect was read or written after its owning scope was disposed.
    #[error("reactive node was disposed and can no longer be accessed")]
    NodeDisposed,
}

/// The outcome of a [`crate::zen_async::zen_async`] fetch, surfaced through
/// [`crate::zen_async::AsyncState::error`].
#[derive(Debug, Error, Clone)]
#[error("zenAsync fetch failed: {message}")]
pub struct ZenAsyncError {
    pub(crate) message: String,
}

impl ZenAsyncError {
    pub(crate) fn from_display(err: impl std::fmt::Display) -> Self {
        Self { message: err.to_string() }
    }
}

/// Extracts a human-readable message from a caught panic payload. Used to log effect and cleanup
/// callback panics before swallowing them (see the crate's error-handling policy: user effect and
/// cleanup errors never abort the scheduler, unlike a `calc` panic).
#[cfg(feature = "trace")]
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
