//! Error types for kvlayer
//!
//! `Error` is the unified error type returned by every public operation in
//! every crate of this workspace. It matches the five error kinds of
//! §7 plus `Fatal`, which is raised once a commit-phase failure has begun
//! applying writes and further operations must be refused.

use thiserror::Error;

/// Result type alias used throughout kvlayer.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all kvlayer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A lookup or delete targeted a key that does not exist.
    ///
    /// Always carries the stable code string `NoSuchKey`, regardless of
    /// which engine produced it, per §6.1.
    #[error("NoSuchKey: {0}")]
    NotFound(String),

    /// A type or value constraint was violated: a buffer value was given
    /// for a JSON key, a structured value for a binary key, a range was
    /// out of bounds, or a date/number literal could not be parsed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A JSON payload or PxQL query string could not be parsed.
    #[error("parse error: {0}")]
    ParseError(String),

    /// An already-completed transaction instance was reused.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A storage engine reported a transport or storage failure.
    #[error("engine error: {0}")]
    EngineError(String),

    /// A commit-phase failure occurred after the rollback log had begun
    /// applying writes to the engine. The store must refuse further
    /// operations once this is raised.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Wraps a lower-level I/O failure (log files, per-transaction data
    /// files, filesystem-engine operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `NotFound` error for `key`, carrying the `NoSuchKey` code
    /// every engine must normalize to per §6.1.
    pub fn not_found(key: impl std::fmt::Display) -> Self {
        Error::NotFound(key.to_string())
    }

    /// The stable error code string, for callers that match on codes
    /// rather than variants (mirrors the source system's string codes).
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NoSuchKey",
            Error::InvalidInput(_) => "InvalidInput",
            Error::ParseError(_) => "ParseError",
            Error::Conflict(_) => "Conflict",
            Error::EngineError(_) => "EngineError",
            Error::Fatal(_) => "Fatal",
            Error::Io(_) => "IoError",
        }
    }

    /// True for `NotFound` errors, which propagate to the caller without
    /// side effects per §7's propagation policy.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for errors that, if raised inside an active transaction,
    /// should trigger an automatic abort per §7.
    pub fn triggers_abort(&self) -> bool {
        matches!(self, Error::EngineError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_stable_code() {
        let e = Error::not_found("users/bob");
        assert_eq!(e.code(), "NoSuchKey");
        assert!(e.is_not_found());
    }

    #[test]
    fn engine_error_triggers_abort() {
        assert!(Error::EngineError("timeout".into()).triggers_abort());
        assert!(!Error::InvalidInput("bad".into()).triggers_abort());
    }
}
