//! Object-store implementation of the [`TagStore`] contract: one
//! object per `(aggregate, tag)` pair holding the set of tagged ids,
//! maintained by read-modify-write cycles under precondition.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::backend::{Backend, BackendError, Precondition};
use crate::document::ObjectDocument;
use crate::error::{ensure_object_name, Error};
use crate::hash::ConflictError;
use crate::objectstore::{
    container_name, deserialize_json, keys, map_backend_error, serialize_json,
    ContainerVerification, ObjectStoreConfig,
};
use crate::store::{TagKind, TagStore};

/// The backend-stored entry of one `(aggregate, tag)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDocument {
    /// The tag value.
    pub tag: String,

    /// Tagged ids: object ids for document tags, stream identifiers
    /// for stream tags.
    #[serde(default)]
    pub object_ids: BTreeSet<String>,
}

/// [`TagStore`] over an object-store [`Backend`].
#[derive(Debug, Clone)]
pub struct ObjectTagStore {
    backend: Arc<dyn Backend>,
    config: ObjectStoreConfig,
    verification: Arc<ContainerVerification>,
    kind: TagKind,
}

impl ObjectTagStore {
    /// Creates a tag store of the given kind over the given backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        config: ObjectStoreConfig,
        verification: Arc<ContainerVerification>,
        kind: TagKind,
    ) -> Self {
        Self {
            backend,
            config,
            verification,
            kind,
        }
    }

    fn key(&self, tag: &str) -> String {
        match self.kind {
            TagKind::Document => keys::document_tag(tag),
            TagKind::Stream => keys::stream_tag(tag),
        }
    }

    fn tagged_id(&self, document: &ObjectDocument) -> String {
        match self.kind {
            TagKind::Document => document.object_id.clone(),
            TagKind::Stream => document.active.stream_identifier.clone(),
        }
    }

    async fn fetch(
        &self,
        operation: &'static str,
        container: &str,
        key: &str,
    ) -> Result<Option<(TagDocument, String)>, Error> {
        let Some(fetched) = self
            .backend
            .get_object(container, key)
            .await
            .map_err(|err| map_backend_error(operation, err))?
        else {
            return Ok(None);
        };

        let entry = deserialize_json::<TagDocument>(operation, &fetched.bytes)?;
        Ok(Some((entry, fetched.token)))
    }
}

#[async_trait]
impl TagStore for ObjectTagStore {
    fn kind(&self) -> TagKind {
        self.kind
    }

    #[instrument(
        name = "ObjectTagStore.set",
        skip(self, document),
        fields(object_name = %document.object_name, object_id = %document.object_id)
    )]
    async fn set(&self, document: &ObjectDocument, tag: &str) -> Result<(), Error> {
        let container = container_name(&document.object_name);
        self.verification
            .verify(self.backend.as_ref(), &container, &self.config, "set_tag")
            .await?;

        let key = self.key(tag);
        let id = self.tagged_id(document);

        for _attempt in 0..=self.config.tag_write_retries {
            let (mut entry, token) = match self.fetch("set_tag", &container, &key).await? {
                Some((entry, token)) => (entry, Some(token)),
                None => (
                    TagDocument {
                        tag: tag.to_owned(),
                        object_ids: BTreeSet::new(),
                    },
                    None,
                ),
            };

            if !entry.object_ids.insert(id.clone()) {
                // Already tagged; nothing to write.
                return Ok(());
            }

            let bytes = serialize_json("set_tag", &entry)?;
            let precondition = match token {
                Some(token) => Precondition::IfMatch(token),
                None => Precondition::IfNoneMatch,
            };

            match self
                .backend
                .put_object(&container, &key, bytes, precondition)
                .await
            {
                Ok(_) => return Ok(()),
                // Lost the read-modify-write race; re-read and retry.
                Err(BackendError::PreconditionFailed) => continue,
                Err(err) => return Err(map_backend_error("set_tag", err)),
            }
        }

        Err(Error::Conflict(ConflictError::precondition()))
    }

    async fn get(&self, object_name: &str, tag: &str) -> Result<BTreeSet<String>, Error> {
        ensure_object_name("get_tag", object_name)?;

        let container = container_name(object_name);
        let key = self.key(tag);

        Ok(self
            .fetch("get_tag", &container, &key)
            .await?
            .map(|(entry, _)| entry.object_ids)
            .unwrap_or_default())
    }

    #[instrument(
        name = "ObjectTagStore.remove",
        skip(self, document),
        fields(object_name = %document.object_name, object_id = %document.object_id)
    )]
    async fn remove(&self, document: &ObjectDocument, tag: &str) -> Result<(), Error> {
        let container = container_name(&document.object_name);
        let key = self.key(tag);
        let id = self.tagged_id(document);

        for _attempt in 0..=self.config.tag_write_retries {
            let Some((mut entry, token)) = self.fetch("remove_tag", &container, &key).await? else {
                return Ok(());
            };

            if !entry.object_ids.remove(&id) {
                return Ok(());
            }

            if entry.object_ids.is_empty() {
                self.backend
                    .delete_object(&container, &key)
                    .await
                    .map_err(|err| map_backend_error("remove_tag", err))?;
                tracing::debug!(tag, "empty tag entry deleted");
                return Ok(());
            }

            let bytes = serialize_json("remove_tag", &entry)?;
            match self
                .backend
                .put_object(&container, &key, bytes, Precondition::IfMatch(token))
                .await
            {
                Ok(_) => return Ok(()),
                Err(BackendError::PreconditionFailed) => continue,
                Err(err) => return Err(map_backend_error("remove_tag", err)),
            }
        }

        Err(Error::Conflict(ConflictError::precondition()))
    }
}
