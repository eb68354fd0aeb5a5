/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Crate-wide error taxonomy.
//!
//! Kinds mirror the error handling design of the transition pipeline: bad
//! configuration, disagreement with an authoritative result, a transaction
//! failing pre-validation, a handler violating its contract, transient I/O,
//! and explicit cancellation. Only the single tolerated status divergence
//! (see [crate::executor::check_status]) is ever swallowed instead of
//! propagated as one of these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad CLI arguments, missing data directory, unopenable database.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The computed result disagreed with the authoritative one.
    #[error("integrity error at height {height}{}: {reason}", index.map(|i| format!(" receipt[{i}]")).unwrap_or_default())]
    Integrity {
        height: u64,
        index: Option<usize>,
        reason: String,
    },

    /// A transaction failed `PreValidate`.
    #[error("validation error: {0}")]
    Validation(String),

    /// The transaction handler itself failed, as distinct from producing a
    /// failure-status receipt. There is no graceful recovery from this.
    #[error("handler invariant violated: {0}")]
    HandlerInvariant(String),

    /// Database write, remote fetch, or socket failure. Not retried by the core.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Execution was cancelled before it finished.
    #[error("transition was canceled")]
    Cancellation,

    /// A transition method was called from a state that forbids it
    /// (e.g. calling `execute` twice).
    #[error("invalid transition state: {0}")]
    InvalidState(String),

    /// `to < from` was requested, or a negative height was supplied where
    /// not permitted.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

impl Error {
    /// Wraps an error with height context the way the executor's outer loop
    /// does for every propagated failure (`FailureInPropose(height=...)` etc),
    /// widening the message without changing the error's kind: a `Validation`
    /// failure stays `Validation`, an `Integrity` failure stays `Integrity`,
    /// and so on. Collapsing everything onto a single variant here would
    /// make a deterministic validation failure indistinguishable from a
    /// genuinely transient one — and only `TransientIo` is documented as
    /// safe to retry a whole run against.
    pub fn in_height_context(self, prefix: &str, height: u64) -> Error {
        let context = format!("{prefix}(height={height})");
        match self {
            Error::Configuration(msg) => Error::Configuration(format!("{context}: {msg}")),
            Error::Integrity { height, index, reason } => Error::Integrity {
                height,
                index,
                reason: format!("{context}: {reason}"),
            },
            Error::Validation(msg) => Error::Validation(format!("{context}: {msg}")),
            Error::HandlerInvariant(msg) => Error::HandlerInvariant(format!("{context}: {msg}")),
            Error::TransientIo(msg) => Error::TransientIo(format!("{context}: {msg}")),
            Error::Cancellation => Error::Cancellation,
            Error::InvalidState(msg) => Error::InvalidState(format!("{context}: {msg}")),
            Error::IllegalArgument(msg) => Error::IllegalArgument(format!("{context}: {msg}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::TransientIo(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransientIo(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::TransientIo(e.to_string())
    }
}
