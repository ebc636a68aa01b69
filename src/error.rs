//! Error types for tree updates.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Procedure and host-callback failures are carried as
/// [`TreeError::Raised`] wrapping an `Arc<anyhow::Error>`, so they stay
/// cheap to clone while an error routes through the tree looking for an
/// ancestor that accepts it. Usage errors (protocol violations by a
/// procedure, such as consuming props twice between yields) are programmer
/// errors and panic at the offending call site instead of appearing here.
#[derive(Debug, Clone, Error)]
pub enum TreeError {
    /// A logic procedure, host callback, or step function raised an error
    /// and no ancestor accepted it.
    ///
    /// Inside the tree this is recoverable: the error is injected into the
    /// nearest ancestor logic node whose procedure supports
    /// resumption-with-error. It only reaches the external caller when the
    /// root is reached with no acceptor.
    #[error("procedure raised: {0}")]
    Raised(Arc<anyhow::Error>),

    /// The node behind a handle (or a pending update) was unmounted before
    /// the operation completed.
    #[error("node is unmounted")]
    Unmounted,

    /// The renderer that owned the tree was dropped while a deferred
    /// completion was still outstanding.
    #[error("renderer was dropped")]
    RendererGone,
}

impl TreeError {
    /// Wrap a user error for routing through the tree.
    pub fn raised(err: impl Into<anyhow::Error>) -> Self {
        TreeError::Raised(Arc::new(err.into()))
    }

    /// Returns a reference to the inner user error if this is a `Raised`
    /// variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            TreeError::Raised(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `Raised` error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}
