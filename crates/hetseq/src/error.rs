//! Error types shared by the containers and the queue.

use thiserror::Error;

/// The allocator could not satisfy a request under the specified progress
/// guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocation failed")]
pub struct AllocError;

/// An element constructor (copy or default) reported failure.
///
/// Rust constructors are infallible by default; types opt into fallible
/// construction through [`TryClone`](crate::TryClone) and
/// [`TryDefault`](crate::TryDefault). The reason string carries whatever the
/// underlying type reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("element construction failed: {reason}")]
pub struct CtorError {
    reason: String,
}

impl CtorError {
    /// Creates a constructor error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason reported by the failing constructor.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A stream feature (`fmt_write` / `parse_read`) failed during element I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Formatting the element into the output stream failed.
    #[error("formatting element failed")]
    Write,
    /// Parsing an element out of the input failed.
    #[error("parsing element failed: {0}")]
    Parse(String),
}

/// A mutation of the dense containers failed. The container is left
/// observationally unchanged (strong guarantee).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenseError {
    /// The new block could not be allocated.
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// An element constructor failed while building the new block.
    #[error(transparent)]
    Ctor(#[from] CtorError),
}

/// A `try_*` dynamic put failed.
///
/// Contention failures are ordinary return values, never panics; constructor
/// failures surface the underlying cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TryPushError {
    /// The requested progress guarantee could not be honored; the queue is
    /// observationally unchanged.
    #[error("progress guarantee could not be honored")]
    Contention,
    /// The element constructor failed; the slot was discarded without
    /// becoming observable.
    #[error(transparent)]
    Ctor(#[from] CtorError),
}

/// Registering a producer or consumer handle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// The single-cardinality side already handed out its handle.
    #[error("the single handle for this side is already taken")]
    AlreadyTaken,
}
