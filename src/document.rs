//! The per-aggregate metadata record anchoring the active stream, the
//! hash chain, chunking and snapshot metadata.
//!
//! One [`ObjectDocument`] exists per `(object_name, object_id)` pair.
//! It is created on first commit (or explicitly through
//! `get_or_create`), mutated only by successful commits and admin
//! operations, and never destroyed by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-aggregate metadata record. See the module documentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDocument {
    /// Stable aggregate kind, e.g. `"users"`. Lowercased when used as
    /// the backend container name.
    pub object_name: String,

    /// Identity of the aggregate instance.
    pub object_id: String,

    /// The stream currently accepting appends.
    pub active: StreamInformation,

    /// Past streams replaced by the active one, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminated_streams: Vec<StreamInformation>,

    /// Optional schema marker for external migration tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,

    /// Commit fingerprint after the last successful append. `None`
    /// until the first commit; the literal `"*"` disables concurrency
    /// checks.
    #[serde(default)]
    pub hash: Option<String>,

    /// Commit fingerprint before the last successful append.
    #[serde(default)]
    pub prev_hash: Option<String>,

    /// Backend precondition token from the read that produced this
    /// document. Lives for at most one commit; never persisted.
    #[serde(skip)]
    pub(crate) etag: Option<String>,
}

/// The stream bookkeeping embedded in [`ObjectDocument::active`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInformation {
    /// Unique identifier of this stream within the object.
    pub stream_identifier: String,

    /// Last committed event version, `-1` while the stream is empty.
    pub current_stream_version: i64,

    /// Backend family serving the event data, e.g. `"object-store"`.
    pub stream_type: String,
    /// Backend family serving the object document.
    pub document_type: String,
    /// Backend family serving the document-tag index.
    pub document_tag_type: String,
    /// Backend family serving the stream-tag index.
    pub event_stream_tag_type: String,
    /// Backend family serving document references.
    pub document_ref_type: String,

    /// Named data-store instance serving this stream.
    pub data_store: String,
    /// Named document-store instance serving this stream.
    pub document_store: String,
    /// Named document-tag-store instance serving this stream.
    pub document_tag_store: String,
    /// Named stream-tag-store instance, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_tag_store: Option<String>,
    /// Named snapshot-store instance, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_shot_store: Option<String>,

    /// Connection name for the data store.
    pub data_connection: String,
    /// Connection name for the document store.
    pub document_connection: String,
    /// Connection name for the document-tag store.
    pub document_tag_connection: String,
    /// Connection name for the stream-tag store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_tag_connection: Option<String>,
    /// Connection name for the snapshot store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_shot_connection: Option<String>,

    /// Sealed chunk objects for long streams, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_chunks: Vec<StreamChunk>,

    /// Snapshots recorded against this stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snap_shots: Vec<StreamSnapShot>,

    /// Chunking behavior; `None` disables chunking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_settings: Option<ChunkSettings>,

    /// Set when rollback of a failed commit itself failed. While
    /// present, the stream refuses appends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_stream_info: Option<BrokenStreamInfo>,

    /// Append-only history of rollbacks performed on this stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_history: Vec<RollbackRecord>,
}

/// One sealed chunk object of a long stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    /// Ordinal of the chunk, starting at 0.
    pub chunk_id: u32,
    /// First event version stored in the chunk.
    pub first_event_version: i64,
    /// Last event version stored in the chunk.
    pub last_event_version: i64,
}

/// A snapshot recorded against a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapShot {
    /// Name of the snapshot object.
    pub name: String,
    /// The snapshot covers events up to and including this version.
    pub until_version: i64,
}

/// Chunking behavior for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSettings {
    /// Whether the active data document spills into chunk objects.
    pub enable_chunks: bool,
    /// Number of events after which the active document is sealed.
    pub chunk_size: usize,
}

/// Recorded when rollback of a failed commit itself failed, leaving an
/// orphaned version range in the stream data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokenStreamInfo {
    /// When the stream was marked broken.
    pub broken_at: DateTime<Utc>,
    /// First orphaned event version.
    pub orphaned_from: i64,
    /// Last orphaned event version.
    pub orphaned_to: i64,
    /// Message of the failure that triggered the rollback.
    pub error_message: String,
    /// Stable code of the failure that triggered the rollback.
    pub original_error_type: String,
    /// Stable code of the failure the rollback itself hit.
    pub cleanup_error_type: String,
}

/// One entry of [`StreamInformation::rollback_history`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    /// When the rollback ran.
    pub rolled_back_at: DateTime<Utc>,
    /// First version of the rolled-back range.
    pub from_version: i64,
    /// Last version of the rolled-back range.
    pub to_version: i64,
    /// How many events the rollback actually removed.
    pub events_removed: i64,
    /// Message of the failure that triggered the rollback.
    pub original_error: String,
    /// Stable code of the failure that triggered the rollback.
    pub original_error_type: String,
}

/// The store bindings a fresh stream is created with: which named
/// instances and connections serve each store category, and which
/// backend family they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSelection {
    /// Backend family name recorded on the stream's type tags.
    pub backend_family: String,
    /// Named data-store instance.
    pub data_store: String,
    /// Named document-store instance.
    pub document_store: String,
    /// Named document-tag-store instance.
    pub document_tag_store: String,
    /// Named stream-tag-store instance, when configured.
    pub stream_tag_store: Option<String>,
    /// Named snapshot-store instance, when configured.
    pub snap_shot_store: Option<String>,
    /// Connection name applied to every category.
    pub connection: String,
    /// Chunking behavior for fresh streams.
    pub chunk_settings: Option<ChunkSettings>,
}

impl StoreSelection {
    /// A selection pointing every category at the same named store over
    /// the `"default"` connection.
    #[must_use]
    pub fn single_store(backend_family: impl Into<String>, store: impl Into<String>) -> Self {
        let store = store.into();
        Self {
            backend_family: backend_family.into(),
            data_store: store.clone(),
            document_store: store.clone(),
            document_tag_store: store.clone(),
            stream_tag_store: Some(store),
            snap_shot_store: None,
            connection: "default".to_owned(),
            chunk_settings: None,
        }
    }
}

impl StreamInformation {
    /// A fresh, empty stream bound to the given stores.
    #[must_use]
    pub fn new(stream_identifier: impl Into<String>, selection: &StoreSelection) -> Self {
        Self {
            stream_identifier: stream_identifier.into(),
            current_stream_version: -1,
            stream_type: selection.backend_family.clone(),
            document_type: selection.backend_family.clone(),
            document_tag_type: selection.backend_family.clone(),
            event_stream_tag_type: selection.backend_family.clone(),
            document_ref_type: selection.backend_family.clone(),
            data_store: selection.data_store.clone(),
            document_store: selection.document_store.clone(),
            document_tag_store: selection.document_tag_store.clone(),
            stream_tag_store: selection.stream_tag_store.clone(),
            snap_shot_store: selection.snap_shot_store.clone(),
            data_connection: selection.connection.clone(),
            document_connection: selection.connection.clone(),
            document_tag_connection: selection.connection.clone(),
            stream_tag_connection: selection
                .stream_tag_store
                .as_ref()
                .map(|_| selection.connection.clone()),
            snap_shot_connection: selection
                .snap_shot_store
                .as_ref()
                .map(|_| selection.connection.clone()),
            stream_chunks: Vec::new(),
            snap_shots: Vec::new(),
            chunk_settings: selection.chunk_settings,
            broken_stream_info: None,
            rollback_history: Vec::new(),
        }
    }

    /// Whether no event has been committed to this stream yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_stream_version < 0
    }

    /// The version the next appended event will take.
    #[must_use]
    pub fn next_version(&self) -> i64 {
        self.current_stream_version + 1
    }

    /// Whether chunk spilling is enabled for this stream.
    #[must_use]
    pub fn chunking_enabled(&self) -> bool {
        self.chunk_settings.map_or(false, |settings| settings.enable_chunks)
    }

    /// The sealed chunk containing the given event version, if any.
    #[must_use]
    pub fn chunk_for_version(&self, version: i64) -> Option<&StreamChunk> {
        self.stream_chunks
            .iter()
            .find(|chunk| chunk.first_event_version <= version && version <= chunk.last_event_version)
    }

    /// Records a freshly sealed chunk and returns its ordinal.
    pub fn add_chunk(&mut self, first_event_version: i64, last_event_version: i64) -> u32 {
        let chunk_id = self.stream_chunks.len() as u32;
        self.stream_chunks.push(StreamChunk {
            chunk_id,
            first_event_version,
            last_event_version,
        });
        chunk_id
    }

    /// The first version held by the active (unsealed) data document.
    #[must_use]
    pub fn unsealed_from_version(&self) -> i64 {
        self.stream_chunks
            .last()
            .map_or(0, |chunk| chunk.last_event_version + 1)
    }

    /// Records a snapshot taken of this stream.
    pub fn record_snapshot(&mut self, name: impl Into<String>, until_version: i64) {
        self.snap_shots.push(StreamSnapShot {
            name: name.into(),
            until_version,
        });
    }

    /// Appends an entry to the rollback history.
    pub fn record_rollback(&mut self, record: RollbackRecord) {
        self.rollback_history.push(record);
    }

    /// Whether the stream refuses appends until an admin repair.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken_stream_info.is_some()
    }
}

impl ObjectDocument {
    /// A fresh document whose active stream is empty and whose hash
    /// chain has not started yet.
    #[must_use]
    pub fn new(
        object_name: impl Into<String>,
        object_id: impl Into<String>,
        stream_identifier: impl Into<String>,
        selection: &StoreSelection,
    ) -> Self {
        Self {
            object_name: object_name.into(),
            object_id: object_id.into(),
            active: StreamInformation::new(stream_identifier, selection),
            terminated_streams: Vec::new(),
            schema_version: None,
            hash: None,
            prev_hash: None,
            etag: None,
        }
    }

    /// Advances the hash chain after a successful commit: the current
    /// fingerprint becomes the previous one and the new fingerprint
    /// becomes current.
    pub fn advance_hash(&mut self, new_hash: impl Into<String>) {
        self.prev_hash = self.hash.take();
        self.hash = Some(new_hash.into());
    }

    /// Terminates the active stream and installs a fresh successor
    /// bound to the same stores. Used to continue an aggregate whose
    /// stream was closed.
    pub fn terminate_active_stream(&mut self, successor_stream_id: impl Into<String>) {
        let selection = StoreSelection {
            backend_family: self.active.stream_type.clone(),
            data_store: self.active.data_store.clone(),
            document_store: self.active.document_store.clone(),
            document_tag_store: self.active.document_tag_store.clone(),
            stream_tag_store: self.active.stream_tag_store.clone(),
            snap_shot_store: self.active.snap_shot_store.clone(),
            connection: self.active.data_connection.clone(),
            chunk_settings: self.active.chunk_settings,
        };

        let successor = StreamInformation::new(successor_stream_id, &selection);
        let terminated = std::mem::replace(&mut self.active, successor);
        self.terminated_streams.push(terminated);
    }

    /// Marks the active stream broken. Appends refuse until
    /// [`clear_broken`][ObjectDocument::clear_broken] runs.
    pub fn mark_broken(&mut self, info: BrokenStreamInfo) {
        self.active.broken_stream_info = Some(info);
    }

    /// Clears the broken marker after an admin repair, returning the
    /// orphan range that was recorded.
    pub fn clear_broken(&mut self) -> Option<BrokenStreamInfo> {
        self.active.broken_stream_info.take()
    }

    /// Whether the active stream refuses appends until repaired.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.active.is_broken()
    }
}
