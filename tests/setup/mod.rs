//! Shared harness for the scenario tests: an engine wired over the
//! in-memory backend, wrapped in a fault-injecting decorator so tests
//! can fail specific backend writes on demand.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use chainstream::backend::{
    Backend, BackendError, FetchedObject, InMemoryBackend, Listing, ObjectHead, Precondition,
    PreconditionToken,
};
use chainstream::document::StoreSelection;
use chainstream::event::Event;
use chainstream::objectstore::{
    ContainerVerification, ObjectDataStore, ObjectDocumentStore, ObjectProjectionStore,
    ObjectStoreConfig, ObjectTagStore,
};
use chainstream::registry::{AggregateStorageRegistry, StoreDefaults, Stores};
use chainstream::store::{DocumentStore, TagKind, TagStore, UuidIdProvider};
use chainstream::stream::EventStreams;

/// One injected fault: fail `put_object` calls whose key contains the
/// given fragment, after letting `skip` matching calls through.
#[derive(Debug)]
struct FaultRule {
    key_contains: String,
    skip: u32,
    seen: u32,
}

/// [`Backend`] decorator that injects write failures per key pattern.
#[derive(Debug, Clone)]
pub struct FaultBackend {
    inner: InMemoryBackend,
    rules: Arc<Mutex<Vec<FaultRule>>>,
}

impl FaultBackend {
    pub fn new() -> Self {
        Self {
            inner: InMemoryBackend::new(),
            rules: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails every put whose key contains `fragment`, after letting
    /// `skip` matching puts through.
    pub fn fail_puts_containing(&self, fragment: &str, skip: u32) {
        self.rules.lock().push(FaultRule {
            key_contains: fragment.to_owned(),
            skip,
            seen: 0,
        });
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.rules.lock().clear();
    }

    /// Keys currently stored in the given container.
    pub fn keys(&self, container: &str) -> Vec<String> {
        self.inner.keys(container)
    }

    fn check_put(&self, key: &str) -> Result<(), BackendError> {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if key.contains(&rule.key_contains) {
                rule.seen += 1;
                if rule.seen > rule.skip {
                    return Err(BackendError::Unavailable(anyhow!(
                        "injected fault on put of '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FaultBackend {
    async fn get_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<FetchedObject>, BackendError> {
        self.inner.get_object(container, key).await
    }

    async fn put_object(
        &self,
        container: &str,
        key: &str,
        bytes: Vec<u8>,
        precondition: Precondition,
    ) -> Result<PreconditionToken, BackendError> {
        self.check_put(key)?;
        self.inner.put_object(container, key, bytes, precondition).await
    }

    async fn head_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<ObjectHead>, BackendError> {
        self.inner.head_object(container, key).await
    }

    async fn delete_object(&self, container: &str, key: &str) -> Result<(), BackendError> {
        self.inner.delete_object(container, key).await
    }

    async fn list_prefix(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Listing, BackendError> {
        self.inner
            .list_prefix(container, prefix, continuation, page_size)
            .await
    }

    async fn ensure_container(&self, container: &str) -> Result<(), BackendError> {
        self.inner.ensure_container(container).await
    }
}

pub const STORE_NAME: &str = "memory";

/// A fully wired engine over a [`FaultBackend`].
pub struct Harness {
    pub backend: Arc<FaultBackend>,
    pub engine: EventStreams,
    pub stores: Arc<Stores>,
    pub registry: Arc<AggregateStorageRegistry>,
    pub documents: Arc<ObjectDocumentStore>,
    pub document_tags: Arc<dyn TagStore>,
    pub stream_tags: Arc<dyn TagStore>,
}

impl Harness {
    pub fn new() -> Self {
        let backend = Arc::new(FaultBackend::new());
        let config = ObjectStoreConfig::default();
        let verification = Arc::new(ContainerVerification::new());

        let document_tags: Arc<dyn TagStore> = Arc::new(ObjectTagStore::new(
            backend.clone(),
            config,
            verification.clone(),
            TagKind::Document,
        ));
        let stream_tags: Arc<dyn TagStore> = Arc::new(ObjectTagStore::new(
            backend.clone(),
            config,
            verification.clone(),
            TagKind::Stream,
        ));
        let documents = Arc::new(ObjectDocumentStore::new(
            backend.clone(),
            config,
            verification.clone(),
            StoreSelection::single_store("object-store", STORE_NAME),
            Arc::new(UuidIdProvider),
            document_tags.clone(),
        ));
        let data = Arc::new(ObjectDataStore::new(
            backend.clone(),
            config,
            verification.clone(),
        ));
        let projections = Arc::new(ObjectProjectionStore::new(
            backend.clone(),
            config,
            verification,
            "projections",
        ));

        let stores = Arc::new(
            Stores::new()
                .with_data_store(STORE_NAME, data)
                .with_document_store(STORE_NAME, documents.clone())
                .with_document_tag_store(STORE_NAME, document_tags.clone())
                .with_stream_tag_store(STORE_NAME, stream_tags.clone())
                .with_projection_store(STORE_NAME, projections)
                .with_defaults(StoreDefaults {
                    data: Some(STORE_NAME.to_owned()),
                    document: Some(STORE_NAME.to_owned()),
                    document_tag: Some(STORE_NAME.to_owned()),
                    stream_tag: Some(STORE_NAME.to_owned()),
                    projection: Some(STORE_NAME.to_owned()),
                }),
        );
        let registry = Arc::new(AggregateStorageRegistry::new());
        let engine = EventStreams::new(stores.clone(), registry.clone());

        Self {
            backend,
            engine,
            stores,
            registry,
            documents,
            document_tags,
            stream_tags,
        }
    }

    /// Bumps the stored document's precondition token out-of-band, so
    /// a session still holding the old token fails its document write.
    pub async fn bump_document_out_of_band(&self, object_name: &str, object_id: &str) {
        let mut other = self
            .documents
            .get(object_name, object_id)
            .await
            .expect("document should exist");
        other.schema_version = Some("bumped".to_owned());
        self.documents
            .set(&mut other)
            .await
            .expect("out-of-band write should succeed");
    }
}

/// A user event with a JSON payload.
pub fn user_event(event_type: &str, name: &str) -> Event {
    Event::new(event_type, serde_json::json!({ "name": name }))
}
