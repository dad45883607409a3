//! Error kinds raised by the managed-memory runtime.
//!
//! Mirrors `ce2103::mm::error_code` / `ce2103::mm::error_category`: one
//! variant per failure mode the spec defines, each carrying the same
//! user-facing message text as the original `error_category::message`.

use thiserror::Error;

/// Errors raised by handle, manager, wire, and fault-handler operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ManagedMemoryError {
    /// `mmap`/`mprotect`/`fallocate` failure, or an out-of-region fault
    /// reaching the handler as if it were in-region.
    #[error("memory bus error")]
    MemoryError,

    /// Any RPC whose response is missing, malformed, or explicitly
    /// errored.
    #[error("remote memory operation failed")]
    NetworkFailure,

    /// Dereferencing a null handle, or a null member pointer applied to
    /// a handle.
    #[error("null handle dereferenced")]
    NullDereference,

    /// Array-index or cross-allocation pointer arithmetic violation.
    #[error("array handle index out of bounds")]
    OutOfBounds,

    /// The remote manager was accessed before initialization succeeded.
    #[error("no remote session is active")]
    NoRemoteSession,

    /// A fault-handler result that does not map to any of the above.
    #[error("unknown error")]
    Unknown,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ManagedMemoryError>;
