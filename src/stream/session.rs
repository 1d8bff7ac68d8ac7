//! Append sessions: scoped buffers of pending events committed
//! atomically through the hash-chain protocol.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::document::{BrokenStreamInfo, ObjectDocument, RollbackRecord};
use crate::error::Error;
use crate::event::Event;
use crate::store::{DataStore, DocumentStore};
use crate::stream::EventStreams;

/// A scoped buffer of pending appends on one object's active stream.
///
/// Versions are assigned at [`append`][Session::append] time; nothing
/// reaches the backend until [`commit`][Session::commit]. Dropping the
/// session without committing discards the buffer without I/O.
#[derive(Debug)]
pub struct Session<'a> {
    engine: &'a EventStreams,
    document: ObjectDocument,
    pending: Vec<Event>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(engine: &'a EventStreams, document: ObjectDocument) -> Self {
        Self {
            engine,
            document,
            pending: Vec::new(),
        }
    }

    /// The document the session operates on, including buffered
    /// version advances not yet visible to it.
    #[must_use]
    pub fn document(&self) -> &ObjectDocument {
        &self.document
    }

    /// The buffered events, in append order.
    #[must_use]
    pub fn pending(&self) -> &[Event] {
        &self.pending
    }

    /// Buffers an event, assigning it the next version of the stream.
    /// Returns the assigned version.
    ///
    /// Fails with [`StreamClosed`][Error::StreamClosed] when a buffered
    /// event already closes the stream.
    pub fn append(&mut self, mut event: Event) -> Result<i64, Error> {
        if self.pending.last().is_some_and(Event::is_stream_closure) {
            return Err(Error::StreamClosed {
                object_name: self.document.object_name.clone(),
                object_id: self.document.object_id.clone(),
                stream_id: self.document.active.stream_identifier.clone(),
            });
        }

        let version = self.document.active.next_version() + self.pending.len() as i64;
        event.event_version = version;
        self.pending.push(event);
        Ok(version)
    }

    /// Buffers the reserved closing event, terminating the stream once
    /// committed. Returns the assigned version.
    pub fn close_stream(&mut self) -> Result<i64, Error> {
        self.append(Event::close_stream())
    }

    /// Discards the buffered events without any I/O and hands the
    /// document back.
    #[must_use]
    pub fn abort(self) -> ObjectDocument {
        self.document
    }

    /// Commits the buffered events.
    ///
    /// The batch is appended to the stream data under the hash-chain
    /// check, then the advanced document is persisted under its
    /// precondition token. When the document write fails, the freshly
    /// appended events are rolled back and the original failure is
    /// surfaced; a rollback failure marks the stream broken and
    /// surfaces [`StreamBroken`][Error::StreamBroken] carrying both
    /// causes.
    ///
    /// An empty session commits nothing and succeeds.
    #[instrument(
        name = "Session.commit",
        skip(self),
        fields(
            object_name = %self.document.object_name,
            object_id = %self.document.object_id,
            pending = self.pending.len(),
        )
    )]
    pub async fn commit(self) -> Result<ObjectDocument, Error> {
        let Session {
            engine,
            mut document,
            pending,
        } = self;

        if pending.is_empty() {
            return Ok(document);
        }

        let data = engine.data_store(&document)?;
        let documents = engine.document_store(&document)?;

        let pristine = document.clone();
        let from = document.active.next_version();
        let to = from + pending.len() as i64 - 1;
        let batch_len = pending.len() as i64;
        let cancellation = CancellationToken::new();

        data.append(&mut document, &cancellation, pending).await?;

        match documents.set(&mut document).await {
            Ok(()) => {
                tracing::info!(
                    from_version = from,
                    to_version = to,
                    "session committed"
                );
                Ok(document)
            },
            Err(original) => {
                tracing::warn!(
                    from_version = from,
                    to_version = to,
                    error = %original,
                    "document write failed after data append, rolling back"
                );
                Err(rollback_failed_commit(
                    data.as_ref(),
                    documents.as_ref(),
                    pristine,
                    original,
                    from,
                    to,
                    batch_len,
                )
                .await)
            },
        }
    }
}

/// Unwinds a commit whose data append succeeded but whose document
/// write did not. Returns the error to surface to the caller.
async fn rollback_failed_commit(
    data: &dyn DataStore,
    documents: &dyn DocumentStore,
    pristine: ObjectDocument,
    original: Error,
    from: i64,
    to: i64,
    batch_len: i64,
) -> Error {
    match data
        .remove_events_for_failed_commit(&pristine, from, to)
        .await
    {
        Ok(removed) => {
            if removed != batch_len {
                tracing::warn!(
                    expected = batch_len,
                    removed,
                    "rollback removed an unexpected number of events"
                );
            }

            let mut target = refreshed_or_pristine(documents, pristine).await;
            target.active.record_rollback(RollbackRecord {
                rolled_back_at: Utc::now(),
                from_version: from,
                to_version: to,
                events_removed: removed,
                original_error: original.to_string(),
                original_error_type: original.code().to_owned(),
            });
            persist_best_effort(documents, &mut target, "rollback record").await;

            original
        },
        Err(cleanup) => {
            tracing::error!(
                orphaned_from = from,
                orphaned_to = to,
                error = %cleanup,
                "rollback failed, marking stream broken"
            );

            let mut target = refreshed_or_pristine(documents, pristine).await;
            let (object_name, object_id, stream_id) = (
                target.object_name.clone(),
                target.object_id.clone(),
                target.active.stream_identifier.clone(),
            );

            target.mark_broken(BrokenStreamInfo {
                broken_at: Utc::now(),
                orphaned_from: from,
                orphaned_to: to,
                error_message: original.to_string(),
                original_error_type: original.code().to_owned(),
                cleanup_error_type: cleanup.code().to_owned(),
            });
            persist_best_effort(documents, &mut target, "broken stream marker").await;

            Error::StreamBroken {
                object_name,
                object_id,
                stream_id,
                orphaned_from: from,
                orphaned_to: to,
                original: Some(Box::new(original)),
                cleanup: Some(Box::new(cleanup)),
            }
        },
    }
}

/// The session's precondition token is already known stale when the
/// document write failed; rollback bookkeeping lands on a fresh read
/// when one can be had.
async fn refreshed_or_pristine(
    documents: &dyn DocumentStore,
    pristine: ObjectDocument,
) -> ObjectDocument {
    match documents
        .get(&pristine.object_name, &pristine.object_id)
        .await
    {
        Ok(fresh) => fresh,
        Err(_) => pristine,
    }
}

async fn persist_best_effort(
    documents: &dyn DocumentStore,
    document: &mut ObjectDocument,
    what: &'static str,
) {
    if let Err(err) = documents.set(document).await {
        tracing::warn!(
            object_name = %document.object_name,
            object_id = %document.object_id,
            error = %err,
            "failed to persist {what}"
        );
    }
}
