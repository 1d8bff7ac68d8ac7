//! Object-store implementation of the [`ProjectionStore`] contract:
//! projection blobs in a configured container, a reserved `$status`
//! field, and write-once external checkpoints by fingerprint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::backend::{Backend, BackendError, Precondition};
use crate::error::Error;
use crate::hash::ConflictError;
use crate::objectstore::{keys, map_backend_error, ContainerVerification, ObjectStoreConfig};
use crate::projection::{ProjectionStatus, CHECKPOINT_FIELD, STATUS_FIELD};
use crate::store::ProjectionStore;

/// [`ProjectionStore`] over an object-store [`Backend`], storing all
/// projection blobs of one deployment in a single container.
#[derive(Debug, Clone)]
pub struct ObjectProjectionStore {
    backend: Arc<dyn Backend>,
    config: ObjectStoreConfig,
    verification: Arc<ContainerVerification>,
    container: String,
}

impl ObjectProjectionStore {
    /// Creates a projection store writing into the given container.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        config: ObjectStoreConfig,
        verification: Arc<ContainerVerification>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            config,
            verification,
            container: container.into(),
        }
    }

    fn not_found(&self, blob_name: &str) -> Error {
        Error::NotFound {
            object_name: self.container.clone(),
            object_id: blob_name.to_owned(),
        }
    }

    /// Writes the external checkpoint object for the given fingerprint
    /// unless one already exists.
    async fn write_checkpoint_once(
        &self,
        fingerprint: &str,
        bytes: Vec<u8>,
    ) -> Result<(), Error> {
        let key = keys::checkpoint(fingerprint);

        match self
            .backend
            .put_object(&self.container, &key, bytes, Precondition::IfNoneMatch)
            .await
        {
            Ok(_) => {
                tracing::info!(fingerprint, "external checkpoint written");
                Ok(())
            },
            // An existing checkpoint for the fingerprint stays as-is.
            Err(BackendError::PreconditionFailed) => Ok(()),
            Err(err) => Err(map_backend_error("save", err)),
        }
    }
}

#[async_trait]
impl ProjectionStore for ObjectProjectionStore {
    #[instrument(name = "ObjectProjectionStore.save", skip(self, bytes))]
    async fn save(&self, blob_name: &str, bytes: Vec<u8>) -> Result<(), Error> {
        self.verification
            .verify(self.backend.as_ref(), &self.container, &self.config, "save")
            .await?;

        // Discover the external checkpoint fingerprint, when the blob
        // is JSON carrying one.
        let fingerprint = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|value| {
                value
                    .get(CHECKPOINT_FIELD)
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned)
            });

        self.backend
            .put_object(
                &self.container,
                blob_name,
                bytes.clone(),
                Precondition::Unconditional,
            )
            .await
            .map_err(|err| map_backend_error("save", err))?;

        if let Some(fingerprint) = fingerprint {
            self.write_checkpoint_once(&fingerprint, bytes).await?;
        }

        Ok(())
    }

    async fn load(&self, blob_name: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .backend
            .get_object(&self.container, blob_name)
            .await
            .map_err(|err| map_backend_error("load", err))?
            .map(|fetched| fetched.bytes))
    }

    async fn exists(&self, blob_name: &str) -> Result<bool, Error> {
        Ok(self
            .backend
            .head_object(&self.container, blob_name)
            .await
            .map_err(|err| map_backend_error("exists", err))?
            .is_some())
    }

    async fn delete(&self, blob_name: &str) -> Result<(), Error> {
        self.backend
            .delete_object(&self.container, blob_name)
            .await
            .map_err(|err| map_backend_error("delete", err))
    }

    async fn get_last_modified(&self, blob_name: &str) -> Result<DateTime<Utc>, Error> {
        self.backend
            .head_object(&self.container, blob_name)
            .await
            .map_err(|err| map_backend_error("get_last_modified", err))?
            .map(|head| head.last_modified)
            .ok_or_else(|| self.not_found(blob_name))
    }

    async fn get_status(&self, blob_name: &str) -> Result<ProjectionStatus, Error> {
        let bytes = self
            .load(blob_name)
            .await?
            .ok_or_else(|| self.not_found(blob_name))?;

        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|err| Error::Backend {
                operation: "get_status",
                source: anyhow::Error::new(err).context("projection blob is not valid JSON"),
            })?;

        Ok(ProjectionStatus::from_json(value.get(STATUS_FIELD)))
    }

    #[instrument(name = "ObjectProjectionStore.set_status", skip(self))]
    async fn set_status(&self, blob_name: &str, status: ProjectionStatus) -> Result<(), Error> {
        let fetched = self
            .backend
            .get_object(&self.container, blob_name)
            .await
            .map_err(|err| map_backend_error("set_status", err))?
            .ok_or_else(|| self.not_found(blob_name))?;

        let mut value: serde_json::Value =
            serde_json::from_slice(&fetched.bytes).map_err(|err| Error::Backend {
                operation: "set_status",
                source: anyhow::Error::new(err).context("projection blob is not valid JSON"),
            })?;

        let Some(object) = value.as_object_mut() else {
            return Err(Error::Backend {
                operation: "set_status",
                source: anyhow::anyhow!("projection blob is not a JSON object"),
            });
        };
        object.insert(
            STATUS_FIELD.to_owned(),
            serde_json::Value::from(status.as_int()),
        );

        let bytes = serde_json::to_vec(&value).map_err(|err| Error::Backend {
            operation: "set_status",
            source: anyhow::Error::new(err).context("serializing projection blob"),
        })?;

        self.backend
            .put_object(
                &self.container,
                blob_name,
                bytes,
                Precondition::IfMatch(fetched.token),
            )
            .await
            .map_err(|err| match err {
                BackendError::PreconditionFailed => {
                    Error::Conflict(ConflictError::precondition())
                },
                other => map_backend_error("set_status", other),
            })?;

        Ok(())
    }
}
