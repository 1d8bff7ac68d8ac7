//! Error taxonomy shared by the engine and its storage adapters.
//!
//! Every user-visible failure carries a stable, machine-readable code
//! through [`Error::code`]. Codes are part of the public interface:
//! they never change meaning across releases, and callers are expected
//! to branch on them rather than on error messages.

use crate::hash::ConflictError;

/// All failures surfaced by the engine and the storage adapters.
///
/// Messages name the aggregate, object and operation involved. Backend
/// causes are attached as sources and never leak into the display
/// representation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument failed validation. Not retryable.
    #[error("invalid argument in {operation}: {reason}")]
    InvalidArgument {
        /// The operation that rejected the argument.
        operation: &'static str,
        /// What was wrong with it.
        reason: InvalidArgument,
    },

    /// The requested object document or stream does not exist.
    #[error("no document found for object '{object_name}/{object_id}'")]
    NotFound {
        /// The aggregate kind that was queried.
        object_name: String,
        /// The object identity that was queried.
        object_id: String,
    },

    /// A concurrent writer won the race for this stream. The caller may
    /// retry after re-reading the object document.
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(#[from] ConflictError),

    /// The stream has been terminated with a closing event and accepts
    /// no further appends.
    #[error("stream '{stream_id}' of object '{object_name}/{object_id}' is closed")]
    StreamClosed {
        /// The aggregate kind owning the stream.
        object_name: String,
        /// The object identity owning the stream.
        object_id: String,
        /// The identifier of the closed stream.
        stream_id: String,
    },

    /// Rollback of a failed commit itself failed, leaving an orphaned
    /// version range behind. The stream refuses writes until repaired.
    #[error(
        "stream '{stream_id}' of object '{object_name}/{object_id}' is broken: \
         versions {orphaned_from}..={orphaned_to} are orphaned"
    )]
    StreamBroken {
        /// The aggregate kind owning the stream.
        object_name: String,
        /// The object identity owning the stream.
        object_id: String,
        /// The identifier of the broken stream.
        stream_id: String,
        /// First orphaned event version.
        orphaned_from: i64,
        /// Last orphaned event version.
        orphaned_to: i64,
        /// The failure that triggered the rollback, when surfaced from
        /// a failing commit rather than a refused session.
        #[source]
        original: Option<Box<Error>>,
        /// The failure the rollback itself hit.
        cleanup: Option<Box<Error>>,
    },

    /// The adapter configuration does not support the requested
    /// operation, e.g. an absent container with auto-creation disabled,
    /// or a stream-tag operation without a configured stream-tag store.
    #[error("configuration error in {operation}: {message}")]
    Config {
        /// The operation that could not proceed.
        operation: &'static str,
        /// Which part of the configuration was missing or inconsistent.
        message: String,
    },

    /// No store instance is registered under the requested name for the
    /// requested category, and no default is configured.
    #[error("no {category} registered under '{name}'")]
    FactoryMissing {
        /// The store category that was looked up.
        category: &'static str,
        /// The name the lookup used.
        name: String,
    },

    /// Transport-level failure reported by the backend adapter. The
    /// caller may retry.
    #[error("backend unavailable during {operation}")]
    Backend {
        /// The operation that hit the backend failure.
        operation: &'static str,
        /// The underlying adapter error.
        #[source]
        source: anyhow::Error,
    },

    /// The caller's cancellation handle fired before the operation
    /// finished. Not a failure of the engine or the backend.
    #[error("{operation} was cancelled")]
    Cancelled {
        /// The operation that observed the cancellation.
        operation: &'static str,
    },
}

/// Reasons an argument can be rejected with [`Error::InvalidArgument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidArgument {
    /// The aggregate name was empty or whitespace-only.
    #[error("object name must not be empty")]
    EmptyObjectName,
    /// The object id was empty or whitespace-only.
    #[error("object id must not be empty")]
    EmptyObjectId,
    /// A page size below 1 was requested on id enumeration.
    #[error("page size must be at least 1")]
    PageSize,
    /// An append was attempted with no events in the batch.
    #[error("event batch must not be empty")]
    EmptyEventBatch,
    /// A version range with `from > to` or a negative bound.
    #[error("version range is malformed")]
    MalformedRange,
}

impl Error {
    /// The stable code identifying this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument { reason, .. } => match reason {
                InvalidArgument::EmptyObjectName => "CSES-VAL-0001",
                InvalidArgument::EmptyObjectId => "CSES-VAL-0002",
                InvalidArgument::PageSize => "CSES-VAL-0003",
                InvalidArgument::EmptyEventBatch => "CSES-VAL-0004",
                InvalidArgument::MalformedRange => "CSES-VAL-0005",
            },
            Error::NotFound { .. } => "CSES-NTF-0001",
            Error::Conflict(conflict) => {
                if conflict.is_precondition() {
                    "CSES-CON-0002"
                } else {
                    "CSES-CON-0001"
                }
            },
            Error::StreamClosed { .. } => "CSES-STR-0001",
            Error::StreamBroken { .. } => "CSES-STR-0002",
            Error::Config { .. } => "CSES-CFG-0001",
            Error::FactoryMissing { .. } => "CSES-FAC-0001",
            Error::Backend { .. } => "CSES-BCK-0001",
            Error::Cancelled { .. } => "CSES-CAN-0001",
        }
    }
}

pub(crate) fn ensure_object_name(operation: &'static str, name: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument {
            operation,
            reason: InvalidArgument::EmptyObjectName,
        });
    }
    Ok(())
}

pub(crate) fn ensure_object_id(operation: &'static str, id: &str) -> Result<(), Error> {
    if id.trim().is_empty() {
        return Err(Error::InvalidArgument {
            operation,
            reason: InvalidArgument::EmptyObjectId,
        });
    }
    Ok(())
}

pub(crate) fn ensure_page_size(operation: &'static str, page_size: usize) -> Result<(), Error> {
    if page_size < 1 {
        return Err(Error::InvalidArgument {
            operation,
            reason: InvalidArgument::PageSize,
        });
    }
    Ok(())
}

pub(crate) fn ensure_version_range(
    operation: &'static str,
    from: i64,
    to: i64,
) -> Result<(), Error> {
    if from < 0 || to < from {
        return Err(Error::InvalidArgument {
            operation,
            reason: InvalidArgument::MalformedRange,
        });
    }
    Ok(())
}
