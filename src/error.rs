//! Error types for counter definitions, store access and rollup passes.
//!
//! Three layers of errors are exposed:
//!
//! - [`ConfigError`] - contract violations detected while building a
//!   [`CounterDefinition`](crate::definition::CounterDefinition) or filling a
//!   [`CounterHandle`](crate::counter::CounterHandle). These are programming
//!   errors of the caller and are reported as early as possible.
//! - [`StoreError`] - failures reported by a
//!   [`DocumentStore`](crate::store::DocumentStore). They are surfaced
//!   verbatim; this crate never retries.
//! - [`CounterError`] - the error returned by every public counter operation,
//!   wrapping the two above.
//!
//! # Example
//!
//! ```rust
//! use contatori_distribuiti::error::{ConfigError, CounterError};
//!
//! let err = CounterError::from(ConfigError::ReservedField("did".to_string()));
//! assert!(err.is_config());
//! assert_eq!(err.to_string(), "`did` is a reserved shard field");
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::rollup::RollupReport;

/// Invalid counter configuration or misuse of the counter API.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A caller tried to write one of the fields used for rollup bookkeeping.
    #[error("`{0}` is a reserved shard field")]
    ReservedField(String),

    /// The shard fan-out must be at least one.
    #[error("shard count must be at least 1")]
    ZeroShardCount,

    /// The rollup interval must be a whole number of seconds, at least one
    /// and at most `i64::MAX`.
    #[error("rollup interval must be a whole number of seconds between 1 and i64::MAX, got {0:?}")]
    InvalidRollupInterval(Duration),

    /// The counter name is used as a collection id.
    #[error("invalid counter name `{0}`: must be non-empty and contain no '/'")]
    InvalidName(String),

    /// The shard template did not serialize to a map of fields.
    #[error("shard template must serialize to an object, got {0}")]
    TemplateNotAnObject(&'static str),

    /// The shard template could not be serialized.
    #[error("shard template could not be serialized: {0}")]
    Template(#[from] serde_json::Error),

    /// The delta cannot be represented without losing information.
    #[error("unsupported delta for field `{field}`: {reason}")]
    UnsupportedDelta {
        /// Field the delta was meant for.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Failure reported by a document store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The document already exists.
    #[error("document already exists: {0}")]
    AlreadyExists(String),

    /// The request was malformed, e.g. an increment overflowed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A document path could not be parsed.
    #[error("invalid document path `{0}`")]
    InvalidPath(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A quota or rate limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation was aborted by the store, typically on contention.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The caller cancelled the operation before the store completed it.
    #[error("store call cancelled")]
    Cancelled,
}

/// Error returned by counter operations.
#[derive(Debug, Error)]
pub enum CounterError {
    /// An update was requested without any field deltas.
    #[error("no shard fields specified")]
    NoFieldsSpecified,

    /// The counter was misconfigured or misused.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The document store failed.
    ///
    /// [`StoreError::Cancelled`] is never wrapped here; it converts to
    /// [`CounterError::Cancelled`].
    #[error(transparent)]
    Store(StoreError),

    /// Summing shard values overflowed a 64-bit integer.
    #[error("aggregated value of field `{field}` overflowed")]
    Overflow {
        /// Field whose sum overflowed.
        field: String,
    },

    /// A rollup batch failed; the pass was aborted.
    ///
    /// Groups committed before the failure stay committed and are described
    /// by `committed`.
    #[error("rollup of `{parent}` failed: {source}")]
    Rollup {
        /// Path of the parent whose batch failed.
        parent: String,
        /// The underlying failure.
        #[source]
        source: Box<CounterError>,
        /// Progress made before the failure.
        committed: RollupReport,
    },

    /// Another rollup pass of the same counter is running.
    #[error("a rollup pass of `{0}` is already running")]
    RollupInProgress(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A rollup pass was cancelled by the caller.
    ///
    /// Groups committed before cancellation stay committed and are described
    /// by `committed`.
    #[error("rollup pass cancelled after {} parents", .committed.parents)]
    RollupCancelled {
        /// Progress made before cancellation.
        committed: RollupReport,
    },
}

impl From<StoreError> for CounterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => CounterError::Cancelled,
            err => CounterError::Store(err),
        }
    }
}

impl CounterError {
    /// Returns `true` if the error is a configuration or contract violation.
    pub fn is_config(&self) -> bool {
        matches!(self, CounterError::Config(_))
    }

    /// Returns `true` if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            CounterError::Cancelled | CounterError::RollupCancelled { .. }
        )
    }

    /// Returns the store error behind this error, if any.
    ///
    /// Looks through [`CounterError::Rollup`] to the failure that aborted
    /// the pass.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            CounterError::Store(err) => Some(err),
            CounterError::Rollup { source, .. } => source.store_error(),
            _ => None,
        }
    }
}

/// Result type for counter operations.
pub type Result<T> = std::result::Result<T, CounterError>;
