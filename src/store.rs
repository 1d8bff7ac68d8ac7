//! Contracts implemented by every storage adapter family: the data
//! store holding event streams, the document store holding the
//! per-aggregate metadata record, the tag index, the projection store,
//! and the id and metadata providers.
//!
//! All traits are object-safe and consumed as `Arc<dyn …>` handed out
//! by the [registry][crate::registry::Stores].

use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::document::ObjectDocument;
use crate::error::Error;
use crate::event::Event;
use crate::projection::ProjectionStatus;

/// A lazy, asynchronous sequence of events read from a stream.
pub type EventStream = BoxStream<'static, Result<Event, Error>>;

/// Persists the event data of streams, one backing object per stream
/// (plus sealed chunk objects for long streams).
#[async_trait]
pub trait DataStore: Send + Sync + Debug {
    /// Reads the events of the active stream within the inclusive
    /// version range. `None` bounds default to 0 and the current tip.
    /// An absent backing object yields an empty result, not an error.
    async fn read(
        &self,
        document: &ObjectDocument,
        start: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<Event>, Error>;

    /// Streams the events of the active stream lazily. Cancellation is
    /// tested before every yielded element and at chunk boundaries.
    fn read_as_stream(
        &self,
        document: &ObjectDocument,
        start: Option<i64>,
        until: Option<i64>,
        cancellation: CancellationToken,
    ) -> EventStream;

    /// Appends a batch of events to the active stream under the
    /// optimistic hash-chain check, advancing the document's stream
    /// version and hash chain in memory on success. Persisting the
    /// document afterwards is the caller's responsibility.
    ///
    /// Rejects empty batches with
    /// [`InvalidArgument`][crate::error::Error::InvalidArgument].
    async fn append(
        &self,
        document: &mut ObjectDocument,
        cancellation: &CancellationToken,
        events: Vec<Event>,
    ) -> Result<(), Error>;

    /// Removes events whose version falls within the inclusive range,
    /// left behind by a failed commit. Returns the number of events
    /// actually removed; an absent backing object yields 0. Idempotent:
    /// a second call with the same range removes nothing and does not
    /// write.
    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        from: i64,
        to: i64,
    ) -> Result<i64, Error>;

    /// Moves the active stream's backing object aside under a
    /// stream-scoped key, freeing the active key for a successor
    /// stream. Used by admin continuation of a closed stream.
    async fn archive_stream_data(&self, document: &ObjectDocument) -> Result<(), Error>;
}

/// CRUD for the per-aggregate [`ObjectDocument`], with backend-native
/// optimistic concurrency.
#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    /// Returns the document for `(object_name, object_id)`, creating
    /// and persisting a fresh one when absent. A read racing with a
    /// concurrent create returns whichever document survives.
    async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, Error>;

    /// Returns the document, or fails with
    /// [`NotFound`][crate::error::Error::NotFound].
    async fn get(&self, object_name: &str, object_id: &str) -> Result<ObjectDocument, Error>;

    /// Writes the document under its precondition token, refreshing the
    /// token on success. A precondition failure surfaces as
    /// [`Conflict`][crate::error::Error::Conflict].
    async fn set(&self, document: &mut ObjectDocument) -> Result<(), Error>;

    /// Resolves the tag through the document-tag index and hydrates the
    /// first matching document. Blank ids in the index are skipped.
    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<ObjectDocument>, Error>;

    /// Resolves the tag through the document-tag index and hydrates all
    /// matching documents. Blank ids in the index are skipped.
    async fn get_by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<ObjectDocument>, Error>;
}

/// Which identity a tag index tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// The index maps tags to object ids.
    Document,
    /// The index maps tags to stream identifiers.
    Stream,
}

/// Set-valued secondary index from `(aggregate, tag)` to ids.
#[async_trait]
pub trait TagStore: Send + Sync + Debug {
    /// Which identity this index tracks.
    fn kind(&self) -> TagKind;

    /// Adds the document's id (object id or stream identifier,
    /// depending on [`kind`][TagStore::kind]) to the tag's set.
    /// Idempotent per `(id, tag)`.
    async fn set(&self, document: &ObjectDocument, tag: &str) -> Result<(), Error>;

    /// The set of ids carrying the tag; empty when the tag is unknown.
    async fn get(&self, object_name: &str, tag: &str) -> Result<BTreeSet<String>, Error>;

    /// Removes the document's id from the tag's set, deleting the tag
    /// object once the set becomes empty.
    async fn remove(&self, document: &ObjectDocument, tag: &str) -> Result<(), Error>;
}

/// Persists projections as opaque blobs with a reserved `$status`
/// field, and write-once external checkpoints by fingerprint.
///
/// The object-safe surface works on raw bytes; typed helpers live in
/// [`ProjectionStoreExt`][crate::projection::ProjectionStoreExt].
#[async_trait]
pub trait ProjectionStore: Send + Sync + Debug {
    /// Writes the projection blob. When the blob carries an external
    /// checkpoint fingerprint and no checkpoint object exists for it
    /// yet, the checkpoint object is written as well.
    async fn save(&self, blob_name: &str, bytes: Vec<u8>) -> Result<(), Error>;

    /// Reads the projection blob, `None` when absent.
    async fn load(&self, blob_name: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Whether the projection blob exists.
    async fn exists(&self, blob_name: &str) -> Result<bool, Error>;

    /// Deletes the projection blob. Deleting an absent blob is not an
    /// error.
    async fn delete(&self, blob_name: &str) -> Result<(), Error>;

    /// When the projection blob was last written, or fails with
    /// [`NotFound`][crate::error::Error::NotFound] when absent.
    async fn get_last_modified(&self, blob_name: &str) -> Result<DateTime<Utc>, Error>;

    /// The projection's status, read from the reserved `$status` field
    /// and defaulting to [`ProjectionStatus::Active`] when the field is
    /// absent.
    async fn get_status(&self, blob_name: &str) -> Result<ProjectionStatus, Error>;

    /// Rewrites the reserved `$status` field of the projection blob.
    async fn set_status(&self, blob_name: &str, status: ProjectionStatus) -> Result<(), Error>;
}

/// Read-only stream metadata derived from backend listings. Off the
/// commit hot path.
#[async_trait]
pub trait StreamMetadataProvider: Send + Sync + Debug {
    /// How many backing objects the stream owns (active data document,
    /// sealed chunks, the object document itself).
    async fn event_object_count(&self, object_name: &str, object_id: &str)
        -> Result<usize, Error>;

    /// Enumerates object ids of the aggregate, one page at a time.
    /// Page sizes below 1 are rejected with
    /// [`InvalidArgument`][crate::error::Error::InvalidArgument].
    async fn object_ids(
        &self,
        object_name: &str,
        page_size: usize,
        continuation: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), Error>;
}

/// Supplies fresh object and stream identities.
pub trait IdProvider: Send + Sync + Debug {
    /// A fresh object id.
    fn new_object_id(&self) -> String;

    /// A fresh stream identifier for the given object.
    fn new_stream_id(&self, object_name: &str, object_id: &str) -> String;
}

/// Default [`IdProvider`] issuing UUID-v4-based identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdProvider;

impl IdProvider for UuidIdProvider {
    fn new_object_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn new_stream_id(&self, _object_name: &str, object_id: &str) -> String {
        format!("{object_id}-{}", uuid::Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uuid_provider_issues_unique_ids() {
        let provider = UuidIdProvider;

        assert_ne!(provider.new_object_id(), provider.new_object_id());

        let stream_id = provider.new_stream_id("users", "u1");
        assert!(stream_id.starts_with("u1-"));
        assert_ne!(stream_id, provider.new_stream_id("users", "u1"));
    }
}
