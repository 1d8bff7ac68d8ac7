//! The object-store adapter family: implementations of the store
//! contracts on top of any [`Backend`][crate::backend::Backend], using
//! the canonical object layout:
//!
//! ```text
//! {object_name}/{object_id}.json                      object document
//! {object_name}/{object_id}.events.json               active stream data
//! {object_name}/{object_id}.events.chunk-{NNNNNN}.json  sealed chunk
//! {object_name}/{object_id}.events.{stream_id}.json   archived stream data
//! {object_name}/tags/doc-by-tag/{tag}.json            document-tag entry
//! {object_name}/tags/stream-by-tag/{tag}.json         stream-tag entry
//! {container}/{projection_name}.json                  projection blob
//! {container}/checkpoints/{fingerprint}.json          external checkpoint
//! ```
//!
//! Containers are lowercased aggregate names; an S3-family backend maps
//! them to buckets.

pub mod data;
pub mod document;
pub mod metadata;
pub mod projection;
pub mod tag;

use std::collections::HashSet;

use tokio::sync::Mutex;

use crate::backend::{Backend, BackendError};
use crate::error::Error;
use crate::hash::ConflictError;

pub use data::{ObjectDataStore, StreamDataDocument};
pub use document::ObjectDocumentStore;
pub use metadata::ObjectMetadataProvider;
pub use projection::ObjectProjectionStore;
pub use tag::{ObjectTagStore, TagDocument};

/// Behavior knobs shared by the adapter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    /// Whether containers are created on first use. When disabled, an
    /// absent container surfaces as a configuration error.
    pub auto_create_container: bool,

    /// How many times a tag read-modify-write retries after losing a
    /// precondition race before giving up with a conflict.
    pub tag_write_retries: usize,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            auto_create_container: true,
            tag_write_retries: 4,
        }
    }
}

/// Process-wide cache of verified containers.
///
/// Shared across the adapter family so that N concurrent operations on
/// the same container cause at most one `ensure_container` backend call
/// for the lifetime of the process. The lock is held across the call to
/// keep that bound under concurrency; verification is off the hot path
/// after the first operation per container.
#[derive(Debug, Default)]
pub struct ContainerVerification {
    verified: Mutex<HashSet<String>>,
}

impl ContainerVerification {
    /// Creates an empty verification cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn verify(
        &self,
        backend: &dyn Backend,
        container: &str,
        config: &ObjectStoreConfig,
        operation: &'static str,
    ) -> Result<(), Error> {
        if !config.auto_create_container {
            // The backend reports an absent container on first use.
            return Ok(());
        }

        let mut verified = self.verified.lock().await;
        if verified.contains(container) {
            return Ok(());
        }

        backend
            .ensure_container(container)
            .await
            .map_err(|err| map_backend_error(operation, err))?;

        verified.insert(container.to_owned());
        tracing::debug!(container, "container verified");
        Ok(())
    }
}

/// Lowercased container name of an aggregate.
#[must_use]
pub(crate) fn container_name(object_name: &str) -> String {
    object_name.to_lowercase()
}

pub(crate) mod keys {
    pub(crate) fn document(object_id: &str) -> String {
        format!("{object_id}.json")
    }

    pub(crate) fn events(object_id: &str) -> String {
        format!("{object_id}.events.json")
    }

    pub(crate) fn events_chunk(object_id: &str, chunk_id: u32) -> String {
        format!("{object_id}.events.chunk-{chunk_id:06}.json")
    }

    pub(crate) fn archived_events(object_id: &str, stream_id: &str) -> String {
        format!("{object_id}.events.{stream_id}.json")
    }

    pub(crate) fn document_tag(tag: &str) -> String {
        format!("tags/doc-by-tag/{tag}.json")
    }

    pub(crate) fn stream_tag(tag: &str) -> String {
        format!("tags/stream-by-tag/{tag}.json")
    }

    pub(crate) fn checkpoint(fingerprint: &str) -> String {
        format!("checkpoints/{fingerprint}.json")
    }
}

/// Translates a backend failure into the crate-level taxonomy.
pub(crate) fn map_backend_error(operation: &'static str, err: BackendError) -> Error {
    match err {
        BackendError::ContainerNotFound(container) => Error::Config {
            operation,
            message: format!(
                "container '{container}' does not exist and container auto-creation is disabled"
            ),
        },
        BackendError::PreconditionFailed => Error::Conflict(ConflictError::precondition()),
        BackendError::Unavailable(source) => Error::Backend { operation, source },
    }
}

pub(crate) fn serialize_json<T: serde::Serialize>(
    operation: &'static str,
    value: &T,
) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|err| Error::Backend {
        operation,
        source: anyhow::Error::new(err).context("serializing stored document"),
    })
}

pub(crate) fn deserialize_json<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    bytes: &[u8],
) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|err| Error::Backend {
        operation,
        source: anyhow::Error::new(err).context("deserializing stored document"),
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn concurrent_verification_calls_the_backend_once() {
        let backend = Arc::new(InMemoryBackend::new());
        let verification = Arc::new(ContainerVerification::new());
        let config = ObjectStoreConfig::default();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let backend = Arc::clone(&backend);
            let verification = Arc::clone(&verification);
            handles.push(tokio::spawn(async move {
                verification
                    .verify(backend.as_ref(), "users", &config, "test")
                    .await
            }));
        }

        for handle in handles {
            handle
                .await
                .expect("task should not panic")
                .expect("verification should succeed");
        }

        assert_eq!(1, backend.ensure_container_calls());
    }

    #[tokio::test]
    async fn disabled_auto_creation_skips_the_backend() {
        let backend = InMemoryBackend::new();
        let verification = ContainerVerification::new();
        let config = ObjectStoreConfig {
            auto_create_container: false,
            ..ObjectStoreConfig::default()
        };

        verification
            .verify(&backend, "users", &config, "test")
            .await
            .expect("verification should be a no-op");

        assert_eq!(0, backend.ensure_container_calls());
    }

    #[test]
    fn key_layout_is_canonical() {
        assert_eq!("u1.json", keys::document("u1"));
        assert_eq!("u1.events.json", keys::events("u1"));
        assert_eq!("u1.events.chunk-000003.json", keys::events_chunk("u1", 3));
        assert_eq!("u1.events.s-9.json", keys::archived_events("u1", "s-9"));
        assert_eq!("tags/doc-by-tag/vip.json", keys::document_tag("vip"));
        assert_eq!("tags/stream-by-tag/vip.json", keys::stream_tag("vip"));
        assert_eq!("checkpoints/fp-1.json", keys::checkpoint("fp-1"));
        assert_eq!("users", container_name("Users"));
    }
}
