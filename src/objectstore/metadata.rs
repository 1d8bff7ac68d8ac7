//! Stream metadata derived from backend listings: object counts per
//! stream and paged id enumeration. Off the commit hot path.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::error::{ensure_object_id, ensure_object_name, ensure_page_size, Error};
use crate::objectstore::{container_name, map_backend_error};
use crate::store::StreamMetadataProvider;

const COUNT_PAGE_SIZE: usize = 1000;

/// [`StreamMetadataProvider`] over an object-store [`Backend`].
#[derive(Debug, Clone)]
pub struct ObjectMetadataProvider {
    backend: Arc<dyn Backend>,
}

impl ObjectMetadataProvider {
    /// Creates a metadata provider over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StreamMetadataProvider for ObjectMetadataProvider {
    async fn event_object_count(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<usize, Error> {
        ensure_object_name("event_object_count", object_name)?;
        ensure_object_id("event_object_count", object_id)?;

        let container = container_name(object_name);
        let mut count = 0;
        let mut continuation: Option<String> = None;

        loop {
            let listing = self
                .backend
                .list_prefix(
                    &container,
                    object_id,
                    continuation.as_deref(),
                    COUNT_PAGE_SIZE,
                )
                .await
                .map_err(|err| map_backend_error("event_object_count", err))?;

            count += listing.keys.len();
            match listing.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(count),
            }
        }
    }

    async fn object_ids(
        &self,
        object_name: &str,
        page_size: usize,
        continuation: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), Error> {
        ensure_object_name("object_ids", object_name)?;
        ensure_page_size("object_ids", page_size)?;

        let container = container_name(object_name);
        let listing = self
            .backend
            .list_prefix(&container, "", continuation, page_size)
            .await
            .map_err(|err| map_backend_error("object_ids", err))?;

        // Only plain `{object_id}.json` keys name objects; event data,
        // tag entries and checkpoints share the container.
        let ids = listing
            .keys
            .iter()
            .filter(|key| key.ends_with(".json"))
            .filter(|key| !key.contains(".events."))
            .filter(|key| !key.contains('/'))
            .map(|key| key.trim_end_matches(".json").to_owned())
            .collect();

        Ok((ids, listing.continuation))
    }
}
