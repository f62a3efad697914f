//! Error types for the fusion crate.

use thiserror::Error;

/// Result type alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by worlds, pools, skirmishes, refs and object pools.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A size, offset, id or flag combination was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The resource is held by someone else right now.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// A bounded wait elapsed before the condition was signalled.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The shared primitive was destroyed while in use.
    #[error("destroyed: {0}")]
    Destroyed(&'static str),

    /// The pool heap could not satisfy the allocation.
    #[error("out of shared memory ({needed} bytes needed)")]
    OutOfSharedMemory {
        /// Size of the allocation that failed.
        needed: usize,
    },

    /// The caller does not hold the lock or own the resource.
    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    /// No entry with the given id or key exists.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// A fixed-capacity shared table is full.
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    /// A mapped segment failed magic/version validation.
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
