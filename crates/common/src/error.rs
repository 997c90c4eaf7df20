//! Common error type for document-store and encryption-engine operations.

use thiserror::Error;

/// Error raised by a store handle or encryption engine.
///
/// The boundary traits in [`crate::engine`] all fail with this type; callers
/// that need to react to a specific outcome match on the variant:
/// - [`EngineError::DuplicateKey`]: a unique index rejected a write
/// - [`EngineError::Connection`]: the store could not be reached, or the
///   handle was already closed
/// - [`EngineError::Crypto`]: encryption or decryption failed
#[derive(Debug, Error)]
pub enum EngineError {
    /// A write violated a unique index, e.g. two concurrent data-key
    /// creations for the same alternate name.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The store is unreachable or the connection is no longer usable.
    #[error("connection failure: {0}")]
    Connection(String),

    /// A cryptographic operation failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A store read or write failed for a non-connection reason.
    #[error("store operation failed: {0}")]
    Store(String),

    /// The engine does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl EngineError {
    /// Whether this error is a unique-index violation.
    ///
    /// Data-key creation races are reconciled by re-reading the winning
    /// document when this returns `true`.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, EngineError::DuplicateKey(_))
    }
}
