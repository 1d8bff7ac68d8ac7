//! The event-stream engine: leased append sessions, versioned range
//! reads, rollback of failed commits, and the admin operations moving
//! a stream between its lifecycle states.

mod session;

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use session::Session;

use crate::document::{ObjectDocument, RollbackRecord};
use crate::error::{ensure_version_range, Error};
use crate::event::Event;
use crate::registry::{AggregateStorageRegistry, Stores};
use crate::store::{DataStore, DocumentStore, EventStream, IdProvider, UuidIdProvider};

/// The engine coordinating append sessions and stream lifecycle over
/// the configured stores.
///
/// Object documents are not shared across sessions: every commit works
/// on the copy the caller read, and concurrent writers are detected
/// through the hash chain and backend preconditions.
#[derive(Debug, Clone)]
pub struct EventStreams {
    stores: Arc<Stores>,
    registry: Arc<AggregateStorageRegistry>,
    ids: Arc<dyn IdProvider>,
}

impl EventStreams {
    /// Creates an engine over the given stores and registry, issuing
    /// identities through the default UUID provider.
    #[must_use]
    pub fn new(stores: Arc<Stores>, registry: Arc<AggregateStorageRegistry>) -> Self {
        Self {
            stores,
            registry,
            ids: Arc::new(UuidIdProvider),
        }
    }

    /// Replaces the id provider.
    #[must_use]
    pub fn with_id_provider(mut self, ids: Arc<dyn IdProvider>) -> Self {
        self.ids = ids;
        self
    }

    pub(crate) fn data_store(
        &self,
        document: &ObjectDocument,
    ) -> Result<Arc<dyn DataStore>, Error> {
        self.stores.data_store(
            &self.registry,
            &document.object_name,
            Some(&document.active.data_store),
        )
    }

    pub(crate) fn document_store(
        &self,
        document: &ObjectDocument,
    ) -> Result<Arc<dyn DocumentStore>, Error> {
        self.stores.document_store(
            &self.registry,
            &document.object_name,
            Some(&document.active.document_store),
        )
    }

    /// Opens an append session on the document's active stream.
    ///
    /// The session buffers appends in memory; nothing reaches the
    /// backend until [`Session::commit`]. Dropping the session (or
    /// calling [`Session::abort`]) discards the buffer without I/O.
    ///
    /// A broken stream refuses the session until
    /// [`repair_broken_stream`][EventStreams::repair_broken_stream]
    /// has run.
    pub fn open_session(&self, document: ObjectDocument) -> Result<Session<'_>, Error> {
        if let Some(info) = &document.active.broken_stream_info {
            return Err(Error::StreamBroken {
                object_name: document.object_name.clone(),
                object_id: document.object_id.clone(),
                stream_id: document.active.stream_identifier.clone(),
                orphaned_from: info.orphaned_from,
                orphaned_to: info.orphaned_to,
                original: None,
                cleanup: None,
            });
        }

        Ok(Session::new(self, document))
    }

    /// Reads the events of the active stream within the inclusive
    /// range. `None` bounds default to 0 and the current tip; an
    /// absent stream yields an empty result.
    pub async fn read(
        &self,
        document: &ObjectDocument,
        start: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<Event>, Error> {
        self.data_store(document)?
            .read(document, start, until)
            .await
    }

    /// Streams the events of the active stream lazily, testing the
    /// cancellation handle before every yielded element.
    pub fn read_as_stream(
        &self,
        document: &ObjectDocument,
        start: Option<i64>,
        until: Option<i64>,
        cancellation: CancellationToken,
    ) -> EventStream {
        match self.data_store(document) {
            Ok(store) => store.read_as_stream(document, start, until, cancellation),
            Err(err) => futures::stream::iter([Err(err)]).boxed(),
        }
    }

    /// Removes the events of a failed commit from the active stream
    /// and records the rollback on the document. Returns the number of
    /// events actually removed; calling it again with the same range
    /// removes nothing.
    #[instrument(
        name = "EventStreams.rollback_range",
        skip(self, document),
        fields(object_name = %document.object_name, object_id = %document.object_id)
    )]
    pub async fn rollback_range(
        &self,
        document: &mut ObjectDocument,
        from: i64,
        to: i64,
    ) -> Result<i64, Error> {
        ensure_version_range("rollback_range", from, to)?;

        let removed = self
            .data_store(document)?
            .remove_events_for_failed_commit(document, from, to)
            .await?;

        if removed > 0 {
            document.active.record_rollback(RollbackRecord {
                rolled_back_at: Utc::now(),
                from_version: from,
                to_version: to,
                events_removed: removed,
                original_error: "manual rollback".to_owned(),
                original_error_type: String::new(),
            });
            // Only a rollback reaching the tail moves the version back.
            let current = document.active.current_stream_version;
            if current >= from && current <= to {
                document.active.current_stream_version = from - 1;
            }
            self.document_store(document)?.set(document).await?;
        }

        Ok(removed)
    }

    /// Continues an aggregate whose active stream is closed: archives
    /// the closed stream's data, terminates it on the document and
    /// installs a fresh successor stream. Admin operation.
    #[instrument(
        name = "EventStreams.continue_stream",
        skip(self, document),
        fields(object_name = %document.object_name, object_id = %document.object_id)
    )]
    pub async fn continue_stream(&self, document: &mut ObjectDocument) -> Result<(), Error> {
        let data = self.data_store(document)?;

        let tail = data
            .read(document, Some(document.active.current_stream_version.max(0)), None)
            .await?;
        if !tail.last().is_some_and(Event::is_stream_closure) {
            return Err(Error::Config {
                operation: "continue_stream",
                message: format!(
                    "active stream '{}' of object '{}/{}' is not closed",
                    document.active.stream_identifier,
                    document.object_name,
                    document.object_id,
                ),
            });
        }

        data.archive_stream_data(document).await?;

        let successor = self
            .ids
            .new_stream_id(&document.object_name, &document.object_id);
        document.terminate_active_stream(successor);
        self.document_store(document)?.set(document).await?;

        tracing::info!(
            stream_id = %document.active.stream_identifier,
            "stream continued with a fresh successor"
        );
        Ok(())
    }

    /// Repairs a broken stream: removes the orphaned version range
    /// recorded at break time, reconciles the stream version from the
    /// stored data, clears the broken marker and persists the
    /// document. Returns the number of orphaned events removed.
    /// Admin operation.
    #[instrument(
        name = "EventStreams.repair_broken_stream",
        skip(self, document),
        fields(object_name = %document.object_name, object_id = %document.object_id)
    )]
    pub async fn repair_broken_stream(&self, document: &mut ObjectDocument) -> Result<i64, Error> {
        let Some(info) = document.active.broken_stream_info.clone() else {
            return Err(Error::Config {
                operation: "repair_broken_stream",
                message: format!(
                    "stream '{}' of object '{}/{}' is not broken",
                    document.active.stream_identifier,
                    document.object_name,
                    document.object_id,
                ),
            });
        };

        let data = self.data_store(document)?;
        let removed = data
            .remove_events_for_failed_commit(document, info.orphaned_from, info.orphaned_to)
            .await?;

        // The stream version is authoritative on the document; it is
        // reconciled against the stored data only here.
        let events = data.read(document, None, None).await?;
        document.active.current_stream_version = events
            .last()
            .map_or(document.active.unsealed_from_version() - 1, |event| {
                event.event_version
            });

        document.active.record_rollback(RollbackRecord {
            rolled_back_at: Utc::now(),
            from_version: info.orphaned_from,
            to_version: info.orphaned_to,
            events_removed: removed,
            original_error: info.error_message.clone(),
            original_error_type: info.original_error_type.clone(),
        });
        document.clear_broken();
        self.document_store(document)?.set(document).await?;

        tracing::info!(removed, "broken stream repaired");
        Ok(removed)
    }
}
