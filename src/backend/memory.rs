//! In-memory implementation of the [`Backend`] contract, backed by a
//! thread-safe map. Used for embedding and throughout the test suite.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::backend::{
    Backend, BackendError, FetchedObject, Listing, ObjectHead, Precondition, PreconditionToken,
};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    token: PreconditionToken,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Containers {
    containers: HashMap<String, BTreeMap<String, StoredObject>>,
}

/// In-memory [`Backend`] with full precondition semantics and
/// lexicographic paginated listing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<Containers>>,
    token_counter: Arc<AtomicU64>,
    ensure_calls: Arc<AtomicU64>,
}

impl InMemoryBackend {
    /// Creates an empty backend with no containers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self) -> PreconditionToken {
        let n = self.token_counter.fetch_add(1, Ordering::Relaxed);
        format!("m-{n}")
    }

    /// How many [`Backend::ensure_container`] calls reached this
    /// backend. Lets tests assert that container verification caching
    /// holds.
    #[must_use]
    pub fn ensure_container_calls(&self) -> u64 {
        self.ensure_calls.load(Ordering::Relaxed)
    }

    /// All keys currently stored in the given container.
    #[must_use]
    pub fn keys(&self, container: &str) -> Vec<String> {
        self.inner
            .read()
            .containers
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn get_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<FetchedObject>, BackendError> {
        let inner = self.inner.read();
        let Some(objects) = inner.containers.get(container) else {
            return Ok(None);
        };

        Ok(objects.get(key).map(|stored| FetchedObject {
            bytes: stored.bytes.clone(),
            token: stored.token.clone(),
        }))
    }

    async fn put_object(
        &self,
        container: &str,
        key: &str,
        bytes: Vec<u8>,
        precondition: Precondition,
    ) -> Result<PreconditionToken, BackendError> {
        let token = self.next_token();
        let mut inner = self.inner.write();

        let objects = inner
            .containers
            .get_mut(container)
            .ok_or_else(|| BackendError::ContainerNotFound(container.to_owned()))?;

        match (&precondition, objects.get(key)) {
            (Precondition::IfMatch(expected), Some(stored)) if stored.token != *expected => {
                return Err(BackendError::PreconditionFailed);
            },
            (Precondition::IfMatch(_), None) => return Err(BackendError::PreconditionFailed),
            (Precondition::IfNoneMatch, Some(_)) => return Err(BackendError::PreconditionFailed),
            _ => {},
        }

        objects.insert(
            key.to_owned(),
            StoredObject {
                bytes,
                token: token.clone(),
                last_modified: Utc::now(),
            },
        );

        Ok(token)
    }

    async fn head_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<ObjectHead>, BackendError> {
        let inner = self.inner.read();
        let Some(objects) = inner.containers.get(container) else {
            return Ok(None);
        };

        Ok(objects.get(key).map(|stored| ObjectHead {
            token: stored.token.clone(),
            last_modified: stored.last_modified,
        }))
    }

    async fn delete_object(&self, container: &str, key: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.write();
        if let Some(objects) = inner.containers.get_mut(container) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_prefix(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Listing, BackendError> {
        let inner = self.inner.read();
        let Some(objects) = inner.containers.get(container) else {
            return Ok(Listing::default());
        };

        let keys: Vec<String> = objects
            .range(continuation.unwrap_or_default().to_owned()..)
            .map(|(key, _)| key)
            .filter(|key| continuation.map_or(true, |after| key.as_str() > after))
            .filter(|key| key.starts_with(prefix))
            .take(page_size)
            .cloned()
            .collect();

        // More keys under the prefix after this page means another page.
        let continuation = keys
            .last()
            .filter(|last| {
                objects
                    .range((*last).clone()..)
                    .any(|(key, _)| key > *last && key.starts_with(prefix))
            })
            .cloned();

        Ok(Listing { keys, continuation })
    }

    async fn ensure_container(&self, container: &str) -> Result<(), BackendError> {
        self.ensure_calls.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .containers
            .entry(container.to_owned())
            .or_default();
        Ok(())
    }
}
