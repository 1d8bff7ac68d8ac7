//! The contract every storage backend adapter must supply.
//!
//! The engine talks to backends exclusively through the abstract object
//! operations below: conditional get/put, head, delete, prefix listing
//! and container lifecycle. Precondition tokens are opaque strings
//! (an ETag on object stores); adapters never parse them and callers
//! never persist them beyond one commit.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::InMemoryBackend;

/// An opaque backend-native version marker enabling conditional writes.
pub type PreconditionToken = String;

/// An object fetched together with its precondition token.
///
/// Backends return both from a single call; a separate head-then-get
/// sequence would race with concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedObject {
    /// The raw object bytes.
    pub bytes: Vec<u8>,
    /// The precondition token current at read time.
    pub token: PreconditionToken,
}

/// Metadata returned by [`Backend::head_object`]. Only used outside the
/// commit hot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    /// The precondition token current at head time.
    pub token: PreconditionToken,
    /// When the object was last written.
    pub last_modified: DateTime<Utc>,
}

/// Condition attached to a [`Backend::put_object`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The write succeeds only if the object exists and its current
    /// token equals the given one (If-Match).
    IfMatch(PreconditionToken),
    /// The write succeeds only if the object does not exist yet
    /// (If-None-Match: `*`).
    IfNoneMatch,
    /// The write always succeeds (last writer wins).
    Unconditional,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Keys in lexicographic order.
    pub keys: Vec<String>,
    /// Opaque continuation for the next page; `None` on the last page.
    pub continuation: Option<String>,
}

/// Failures reported by backend adapters, translated by the stores into
/// the crate-level taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The addressed container does not exist.
    #[error("container '{0}' does not exist")]
    ContainerNotFound(String),

    /// The precondition attached to a write was not met.
    #[error("write precondition was not met")]
    PreconditionFailed,

    /// Transport-level failure.
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

/// Abstract object-store operations every backend adapter supplies.
///
/// Containers map to the backend's top-level namespace (an S3 bucket
/// per aggregate name, lowercased). Every method is a suspension point.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Fetches an object and its precondition token in one round trip.
    /// Returns `None` when the object does not exist.
    async fn get_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<FetchedObject>, BackendError>;

    /// Writes an object under the given precondition, returning the new
    /// token. Fails with [`BackendError::PreconditionFailed`] when the
    /// condition is not met.
    async fn put_object(
        &self,
        container: &str,
        key: &str,
        bytes: Vec<u8>,
        precondition: Precondition,
    ) -> Result<PreconditionToken, BackendError>;

    /// Fetches object metadata without the body. Returns `None` when
    /// the object does not exist.
    async fn head_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<ObjectHead>, BackendError>;

    /// Deletes an object. Deleting an absent object is not an error.
    async fn delete_object(&self, container: &str, key: &str) -> Result<(), BackendError>;

    /// Lists up to `page_size` keys starting with `prefix`, resuming
    /// from `continuation` when given.
    async fn list_prefix(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Listing, BackendError>;

    /// Creates the container if it does not exist. Idempotent.
    async fn ensure_container(&self, container: &str) -> Result<(), BackendError>;
}
