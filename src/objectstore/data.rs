//! Object-store implementation of the [`DataStore`] contract: one
//! backing object per active stream, sealed chunk objects for long
//! streams, and the optimistic hash-chain append protocol.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backend::{Backend, BackendError, Precondition};
use crate::document::ObjectDocument;
use crate::error::{ensure_version_range, Error, InvalidArgument};
use crate::event::Event;
use crate::hash::{chain_matches, commit_fingerprint, ConflictError};
use crate::objectstore::{
    container_name, deserialize_json, keys, map_backend_error, serialize_json,
    ContainerVerification, ObjectStoreConfig,
};
use crate::store::{DataStore, EventStream};

/// The backend-stored object holding the events of one stream of one
/// object, together with the hash-chain link used for the optimistic
/// concurrency check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDataDocument {
    /// Identity of the owning aggregate instance.
    pub object_id: String,

    /// Aggregate kind of the owning instance.
    pub object_name: String,

    /// The fingerprint the writer expected the object document to
    /// carry before the last commit; `"*"` disables the check.
    #[serde(default)]
    pub last_object_document_hash: Option<String>,

    /// The stored events, strictly increasing by version.
    #[serde(default)]
    pub events: Vec<Event>,
}

impl StreamDataDocument {
    fn new(object_name: &str, object_id: &str) -> Self {
        Self {
            object_id: object_id.to_owned(),
            object_name: object_name.to_owned(),
            last_object_document_hash: None,
            events: Vec::new(),
        }
    }
}

/// [`DataStore`] over an object-store [`Backend`].
#[derive(Debug, Clone)]
pub struct ObjectDataStore {
    backend: Arc<dyn Backend>,
    config: ObjectStoreConfig,
    verification: Arc<ContainerVerification>,
}

impl ObjectDataStore {
    /// Creates a data store over the given backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        config: ObjectStoreConfig,
        verification: Arc<ContainerVerification>,
    ) -> Self {
        Self {
            backend,
            config,
            verification,
        }
    }

    async fn fetch_data_document(
        &self,
        operation: &'static str,
        container: &str,
        key: &str,
    ) -> Result<Option<(StreamDataDocument, String)>, Error> {
        let Some(fetched) = self
            .backend
            .get_object(container, key)
            .await
            .map_err(|err| map_backend_error(operation, err))?
        else {
            return Ok(None);
        };

        let data = deserialize_json::<StreamDataDocument>(operation, &fetched.bytes)?;
        Ok(Some((data, fetched.token)))
    }

    /// Seals the current active document into a chunk object and
    /// restarts it empty. Runs before an append once the active
    /// document is full, so freshly appended events always live in the
    /// unsealed tail.
    async fn seal_into_chunk(
        &self,
        container: &str,
        document: &mut ObjectDocument,
        data: &mut StreamDataDocument,
    ) -> Result<(), Error> {
        let first = data.events.first().map_or(0, |event| event.event_version);
        let last = data.events.last().map_or(0, |event| event.event_version);

        let chunk_id = document.active.add_chunk(first, last);
        let chunk_key = keys::events_chunk(&document.object_id, chunk_id);
        let bytes = serialize_json("append", data)?;

        self.backend
            .put_object(container, &chunk_key, bytes, Precondition::Unconditional)
            .await
            .map_err(|err| map_backend_error("append", err))?;

        tracing::debug!(
            object_name = %document.object_name,
            object_id = %document.object_id,
            chunk_id,
            first_event_version = first,
            last_event_version = last,
            "active stream data sealed into chunk"
        );

        data.events.clear();
        Ok(())
    }
}

fn in_range(version: i64, start: i64, until: Option<i64>) -> bool {
    version >= start && until.map_or(true, |until| version <= until)
}

fn check_read_range(
    operation: &'static str,
    start: Option<i64>,
    until: Option<i64>,
) -> Result<i64, Error> {
    let start = start.unwrap_or(0);
    let malformed = start < 0 || until.is_some_and(|until| until < start);
    if malformed {
        return Err(Error::InvalidArgument {
            operation,
            reason: InvalidArgument::MalformedRange,
        });
    }
    Ok(start)
}

#[async_trait]
impl DataStore for ObjectDataStore {
    async fn read(
        &self,
        document: &ObjectDocument,
        start: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<Event>, Error> {
        let start = check_read_range("read", start, until)?;
        let container = container_name(&document.object_name);
        let mut events = Vec::new();

        for chunk in &document.active.stream_chunks {
            if chunk.last_event_version < start {
                continue;
            }
            if until.is_some_and(|until| chunk.first_event_version > until) {
                break;
            }

            let chunk_key = keys::events_chunk(&document.object_id, chunk.chunk_id);
            if let Some((data, _)) = self.fetch_data_document("read", &container, &chunk_key).await?
            {
                events.extend(
                    data.events
                        .into_iter()
                        .filter(|event| in_range(event.event_version, start, until)),
                );
            }
        }

        let key = keys::events(&document.object_id);
        if let Some((data, _)) = self.fetch_data_document("read", &container, &key).await? {
            events.extend(
                data.events
                    .into_iter()
                    .filter(|event| in_range(event.event_version, start, until)),
            );
        }

        Ok(events)
    }

    fn read_as_stream(
        &self,
        document: &ObjectDocument,
        start: Option<i64>,
        until: Option<i64>,
        cancellation: CancellationToken,
    ) -> EventStream {
        let store = self.clone();
        let container = container_name(&document.object_name);
        let object_id = document.object_id.clone();
        let chunks = document.active.stream_chunks.clone();

        async_stream::try_stream! {
            let start = check_read_range("read_as_stream", start, until)?;

            let mut sources: Vec<String> = chunks
                .iter()
                .filter(|chunk| chunk.last_event_version >= start)
                .filter(|chunk| !until.is_some_and(|until| chunk.first_event_version > until))
                .map(|chunk| keys::events_chunk(&object_id, chunk.chunk_id))
                .collect();
            sources.push(keys::events(&object_id));

            for key in sources {
                if cancellation.is_cancelled() {
                    Err(Error::Cancelled { operation: "read_as_stream" })?;
                }

                let Some((data, _)) = store
                    .fetch_data_document("read_as_stream", &container, &key)
                    .await?
                else {
                    continue;
                };

                for event in data.events {
                    if cancellation.is_cancelled() {
                        Err(Error::Cancelled { operation: "read_as_stream" })?;
                    }
                    if in_range(event.event_version, start, until) {
                        yield event;
                    }
                }
            }
        }
        .boxed()
    }

    #[instrument(
        name = "ObjectDataStore.append",
        skip(self, document, cancellation, events),
        fields(
            object_name = %document.object_name,
            object_id = %document.object_id,
            batch_len = events.len(),
        )
    )]
    async fn append(
        &self,
        document: &mut ObjectDocument,
        cancellation: &CancellationToken,
        events: Vec<Event>,
    ) -> Result<(), Error> {
        if events.is_empty() {
            return Err(Error::InvalidArgument {
                operation: "append",
                reason: InvalidArgument::EmptyEventBatch,
            });
        }
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled { operation: "append" });
        }

        // The batch must continue the stream contiguously.
        let from = document.active.next_version();
        for (offset, event) in events.iter().enumerate() {
            if event.event_version != from + offset as i64 {
                return Err(Error::InvalidArgument {
                    operation: "append",
                    reason: InvalidArgument::MalformedRange,
                });
            }
        }

        let container = container_name(&document.object_name);
        self.verification
            .verify(self.backend.as_ref(), &container, &self.config, "append")
            .await?;

        let key = keys::events(&document.object_id);
        let existing = self.fetch_data_document("append", &container, &key).await?;
        let fresh_document = existing.is_none();
        let (mut data, token) = match existing {
            Some((data, token)) => (data, Some(token)),
            None => (
                StreamDataDocument::new(&document.object_name, &document.object_id),
                None,
            ),
        };

        if data.events.last().is_some_and(Event::is_stream_closure) {
            return Err(Error::StreamClosed {
                object_name: document.object_name.clone(),
                object_id: document.object_id.clone(),
                stream_id: document.active.stream_identifier.clone(),
            });
        }

        // A stream without a backing object yet cannot conflict.
        let stored = if fresh_document {
            Some(crate::hash::WILDCARD)
        } else {
            data.last_object_document_hash.as_deref()
        };
        let expected = document.hash.as_deref();
        if !chain_matches(stored, expected) {
            return Err(Error::Conflict(ConflictError::chain(expected, stored)));
        }

        // Even under a wildcard bypass the stored events must stay
        // strictly increasing.
        if data.events.last().is_some_and(|last| last.event_version >= from) {
            return Err(Error::InvalidArgument {
                operation: "append",
                reason: InvalidArgument::MalformedRange,
            });
        }

        if let Some(settings) = document.active.chunk_settings {
            if settings.enable_chunks
                && !data.events.is_empty()
                && data.events.len() >= settings.chunk_size
            {
                self.seal_into_chunk(&container, document, &mut data).await?;
            }
        }

        if cancellation.is_cancelled() {
            return Err(Error::Cancelled { operation: "append" });
        }

        let fingerprint = commit_fingerprint(document.hash.as_deref(), &events);
        let to = from + events.len() as i64 - 1;
        data.last_object_document_hash = Some(fingerprint.clone());
        data.events.extend(events);

        let bytes = serialize_json("append", &data)?;
        let precondition = match token {
            Some(token) => Precondition::IfMatch(token),
            None => Precondition::IfNoneMatch,
        };

        self.backend
            .put_object(&container, &key, bytes, precondition)
            .await
            .map_err(|err| match err {
                BackendError::PreconditionFailed => {
                    Error::Conflict(ConflictError::precondition())
                },
                other => map_backend_error("append", other),
            })?;

        document.active.current_stream_version = to;
        document.advance_hash(fingerprint);

        tracing::debug!(
            from_version = from,
            to_version = to,
            "events appended to stream data"
        );
        Ok(())
    }

    #[instrument(
        name = "ObjectDataStore.remove_events_for_failed_commit",
        skip(self, document),
        fields(object_name = %document.object_name, object_id = %document.object_id)
    )]
    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        from: i64,
        to: i64,
    ) -> Result<i64, Error> {
        ensure_version_range("remove_events_for_failed_commit", from, to)?;

        let container = container_name(&document.object_name);
        let key = keys::events(&document.object_id);

        let Some((mut data, token)) = self
            .fetch_data_document("remove_events_for_failed_commit", &container, &key)
            .await?
        else {
            return Ok(0);
        };

        let before = data.events.len();
        data.events
            .retain(|event| !(from..=to).contains(&event.event_version));
        let removed = (before - data.events.len()) as i64;

        if removed == 0 {
            return Ok(0);
        }

        // The failed commit also advanced the recorded fingerprint;
        // reset it to the document's current chain head.
        data.last_object_document_hash = document.hash.clone();

        let bytes = serialize_json("remove_events_for_failed_commit", &data)?;
        self.backend
            .put_object(&container, &key, bytes, Precondition::IfMatch(token))
            .await
            .map_err(|err| map_backend_error("remove_events_for_failed_commit", err))?;

        tracing::warn!(
            from_version = from,
            to_version = to,
            removed,
            "events removed after failed commit"
        );
        Ok(removed)
    }

    async fn archive_stream_data(&self, document: &ObjectDocument) -> Result<(), Error> {
        let container = container_name(&document.object_name);
        let key = keys::events(&document.object_id);

        let Some(fetched) = self
            .backend
            .get_object(&container, &key)
            .await
            .map_err(|err| map_backend_error("archive_stream_data", err))?
        else {
            return Ok(());
        };

        let archived_key =
            keys::archived_events(&document.object_id, &document.active.stream_identifier);
        self.backend
            .put_object(
                &container,
                &archived_key,
                fetched.bytes,
                Precondition::Unconditional,
            )
            .await
            .map_err(|err| map_backend_error("archive_stream_data", err))?;
        self.backend
            .delete_object(&container, &key)
            .await
            .map_err(|err| map_backend_error("archive_stream_data", err))?;

        tracing::info!(
            object_name = %document.object_name,
            object_id = %document.object_id,
            stream_id = %document.active.stream_identifier,
            "stream data archived for continuation"
        );
        Ok(())
    }
}
