//! Object-store implementation of the [`DocumentStore`] contract:
//! per-aggregate containers, `{object_id}.json` keys, ETag-guarded
//! writes, and tag-based hydration through the document-tag index.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::backend::{Backend, BackendError, Precondition};
use crate::document::{ObjectDocument, StoreSelection};
use crate::error::{ensure_object_id, ensure_object_name, Error};
use crate::hash::ConflictError;
use crate::objectstore::{
    container_name, deserialize_json, keys, map_backend_error, serialize_json,
    ContainerVerification, ObjectStoreConfig,
};
use crate::store::{DocumentStore, IdProvider, TagStore};

/// [`DocumentStore`] over an object-store [`Backend`].
///
/// Fresh documents created through
/// [`get_or_create`][DocumentStore::get_or_create] are bound to the
/// stores named by the configured [`StoreSelection`].
#[derive(Debug, Clone)]
pub struct ObjectDocumentStore {
    backend: Arc<dyn Backend>,
    config: ObjectStoreConfig,
    verification: Arc<ContainerVerification>,
    selection: StoreSelection,
    ids: Arc<dyn IdProvider>,
    document_tags: Arc<dyn TagStore>,
}

impl ObjectDocumentStore {
    /// Creates a document store over the given backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        config: ObjectStoreConfig,
        verification: Arc<ContainerVerification>,
        selection: StoreSelection,
        ids: Arc<dyn IdProvider>,
        document_tags: Arc<dyn TagStore>,
    ) -> Self {
        Self {
            backend,
            config,
            verification,
            selection,
            ids,
            document_tags,
        }
    }

    async fn fetch(
        &self,
        operation: &'static str,
        object_name: &str,
        object_id: &str,
    ) -> Result<Option<ObjectDocument>, Error> {
        let container = container_name(object_name);
        let key = keys::document(object_id);

        let Some(fetched) = self
            .backend
            .get_object(&container, &key)
            .await
            .map_err(|err| map_backend_error(operation, err))?
        else {
            return Ok(None);
        };

        let mut document = deserialize_json::<ObjectDocument>(operation, &fetched.bytes)?;
        document.etag = Some(fetched.token);
        Ok(Some(document))
    }
}

#[async_trait]
impl DocumentStore for ObjectDocumentStore {
    #[instrument(name = "ObjectDocumentStore.get_or_create", skip(self))]
    async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, Error> {
        ensure_object_name("get_or_create", object_name)?;
        ensure_object_id("get_or_create", object_id)?;

        let container = container_name(object_name);
        self.verification
            .verify(
                self.backend.as_ref(),
                &container,
                &self.config,
                "get_or_create",
            )
            .await?;

        if let Some(document) = self.fetch("get_or_create", object_name, object_id).await? {
            return Ok(document);
        }

        let stream_id = self.ids.new_stream_id(object_name, object_id);
        let mut document = ObjectDocument::new(object_name, object_id, stream_id, &self.selection);
        let bytes = serialize_json("get_or_create", &document)?;

        let created = self
            .backend
            .put_object(
                &container,
                &keys::document(object_id),
                bytes,
                Precondition::IfNoneMatch,
            )
            .await;

        match created {
            Ok(token) => {
                document.etag = Some(token);
                tracing::info!(object_name, object_id, "object document created");
                Ok(document)
            },
            // Lost a create race: the concurrent creation survives.
            Err(BackendError::PreconditionFailed) => self
                .fetch("get_or_create", object_name, object_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    object_name: object_name.to_owned(),
                    object_id: object_id.to_owned(),
                }),
            Err(err) => Err(map_backend_error("get_or_create", err)),
        }
    }

    async fn get(&self, object_name: &str, object_id: &str) -> Result<ObjectDocument, Error> {
        ensure_object_name("get", object_name)?;
        ensure_object_id("get", object_id)?;

        self.fetch("get", object_name, object_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                object_name: object_name.to_owned(),
                object_id: object_id.to_owned(),
            })
    }

    #[instrument(
        name = "ObjectDocumentStore.set",
        skip(self, document),
        fields(object_name = %document.object_name, object_id = %document.object_id)
    )]
    async fn set(&self, document: &mut ObjectDocument) -> Result<(), Error> {
        ensure_object_name("set", &document.object_name)?;
        ensure_object_id("set", &document.object_id)?;

        let container = container_name(&document.object_name);
        self.verification
            .verify(self.backend.as_ref(), &container, &self.config, "set")
            .await?;

        let key = keys::document(&document.object_id);
        let bytes = serialize_json("set", document)?;
        let precondition = match &document.etag {
            Some(token) => Precondition::IfMatch(token.clone()),
            None => Precondition::IfNoneMatch,
        };

        let token = self
            .backend
            .put_object(&container, &key, bytes, precondition)
            .await
            .map_err(|err| match err {
                BackendError::PreconditionFailed => {
                    Error::Conflict(ConflictError::precondition())
                },
                other => map_backend_error("set", other),
            })?;

        document.etag = Some(token);
        Ok(())
    }

    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<ObjectDocument>, Error> {
        ensure_object_name("get_first_by_tag", object_name)?;

        for object_id in self.document_tags.get(object_name, tag).await? {
            if object_id.trim().is_empty() {
                continue;
            }
            if let Some(document) = self
                .fetch("get_first_by_tag", object_name, &object_id)
                .await?
            {
                return Ok(Some(document));
            }
        }

        Ok(None)
    }

    async fn get_by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<ObjectDocument>, Error> {
        ensure_object_name("get_by_tag", object_name)?;

        let mut documents = Vec::new();
        for object_id in self.document_tags.get(object_name, tag).await? {
            if object_id.trim().is_empty() {
                continue;
            }
            if let Some(document) = self.fetch("get_by_tag", object_name, &object_id).await? {
                documents.push(document);
            }
        }

        Ok(documents)
    }
}
