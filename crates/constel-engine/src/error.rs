//! Engine error taxonomy.
//!
//! Every failure mode is surfaced verbatim with enough context (the dotted
//! query path where applicable) for the caller to act on. The engine never
//! retries; only the caller knows whether re-resolution is safe.

use serde_json::Value;
use thiserror::Error;

use constel_query::ParseError;

use crate::port::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Parse-time, client-caused.
    #[error("malformed query: {0}")]
    MalformedQuery(#[from] ParseError),

    /// Schema mismatch between the query model and the live schema.
    #[error("unresolvable query at `{path}`: {message}")]
    UnresolvableQuery { path: String, message: String },

    /// assert/create validation: a touched scalar role does not name exactly
    /// one value.
    #[error("incomplete resource at `{path}`: scalar role must name exactly one value")]
    IncompleteResource { path: String },

    /// create/update conflict with existing facts. Recoverable by
    /// re-resolving and resubmitting.
    #[error("contradiction at `{path}`: existing {existing} != submitted {submitted}")]
    Contradiction {
        path: String,
        existing: Value,
        submitted: Value,
    },

    /// Stale lock hash. Recoverable by re-resolving and resubmitting.
    #[error("lock hash does not match current state")]
    LockMismatch,

    /// Backend failure, propagated from the store port.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Caller-initiated cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,
}
