//! Process-wide store routing: named adapter instances per category,
//! configured defaults, and the per-aggregate storage registry.
//!
//! Resolution order for every category is: explicit store name, then
//! the aggregate's registry entry, then the configured default. A miss
//! fails with [`FactoryMissing`][crate::error::Error::FactoryMissing]
//! naming the category and the name that was looked up.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;
use crate::store::{DataStore, DocumentStore, ProjectionStore, TagStore};

/// Process-wide map from lowercased aggregate name to preferred store
/// name. Effectively immutable after initialization; replaceable only
/// by explicit reconfiguration.
#[derive(Debug, Default)]
pub struct AggregateStorageRegistry {
    preferred: RwLock<HashMap<String, String>>,
}

impl AggregateStorageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the preferred store for an aggregate.
    pub fn set_store_for(&self, aggregate: &str, store_name: impl Into<String>) {
        self.preferred
            .write()
            .insert(aggregate.to_lowercase(), store_name.into());
    }

    /// The preferred store for an aggregate, when one is registered.
    #[must_use]
    pub fn store_for(&self, aggregate: &str) -> Option<String> {
        self.preferred.read().get(&aggregate.to_lowercase()).cloned()
    }

    /// Replaces the whole mapping. Explicit reconfiguration only.
    pub fn replace_all(&self, mapping: HashMap<String, String>) {
        let lowercased = mapping
            .into_iter()
            .map(|(aggregate, store)| (aggregate.to_lowercase(), store))
            .collect();
        *self.preferred.write() = lowercased;
    }
}

/// Default store names used when neither the caller nor the registry
/// picks one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreDefaults {
    /// Default data store name.
    pub data: Option<String>,
    /// Default document store name.
    pub document: Option<String>,
    /// Default document-tag store name.
    pub document_tag: Option<String>,
    /// Default stream-tag store name.
    pub stream_tag: Option<String>,
    /// Default projection store name.
    pub projection: Option<String>,
}

/// The named adapter instances of a process, one map per category.
#[derive(Debug, Default)]
pub struct Stores {
    data: HashMap<String, Arc<dyn DataStore>>,
    documents: HashMap<String, Arc<dyn DocumentStore>>,
    document_tags: HashMap<String, Arc<dyn TagStore>>,
    stream_tags: HashMap<String, Arc<dyn TagStore>>,
    projections: HashMap<String, Arc<dyn ProjectionStore>>,
    defaults: StoreDefaults,
}

impl Stores {
    /// Creates an empty store set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named data store.
    #[must_use]
    pub fn with_data_store(mut self, name: impl Into<String>, store: Arc<dyn DataStore>) -> Self {
        self.data.insert(name.into(), store);
        self
    }

    /// Registers a named document store.
    #[must_use]
    pub fn with_document_store(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        self.documents.insert(name.into(), store);
        self
    }

    /// Registers a named document-tag store.
    #[must_use]
    pub fn with_document_tag_store(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn TagStore>,
    ) -> Self {
        self.document_tags.insert(name.into(), store);
        self
    }

    /// Registers a named stream-tag store.
    #[must_use]
    pub fn with_stream_tag_store(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn TagStore>,
    ) -> Self {
        self.stream_tags.insert(name.into(), store);
        self
    }

    /// Registers a named projection store.
    #[must_use]
    pub fn with_projection_store(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn ProjectionStore>,
    ) -> Self {
        self.projections.insert(name.into(), store);
        self
    }

    /// Sets the default store names.
    #[must_use]
    pub fn with_defaults(mut self, defaults: StoreDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Resolves the data store serving an aggregate.
    pub fn data_store(
        &self,
        registry: &AggregateStorageRegistry,
        aggregate: &str,
        requested: Option<&str>,
    ) -> Result<Arc<dyn DataStore>, Error> {
        resolve(
            &self.data,
            "data store",
            requested,
            registry.store_for(aggregate),
            self.defaults.data.as_deref(),
        )
    }

    /// Resolves the document store serving an aggregate.
    pub fn document_store(
        &self,
        registry: &AggregateStorageRegistry,
        aggregate: &str,
        requested: Option<&str>,
    ) -> Result<Arc<dyn DocumentStore>, Error> {
        resolve(
            &self.documents,
            "document store",
            requested,
            registry.store_for(aggregate),
            self.defaults.document.as_deref(),
        )
    }

    /// Resolves the document-tag store serving an aggregate.
    pub fn document_tag_store(
        &self,
        registry: &AggregateStorageRegistry,
        aggregate: &str,
        requested: Option<&str>,
    ) -> Result<Arc<dyn TagStore>, Error> {
        resolve(
            &self.document_tags,
            "document tag store",
            requested,
            registry.store_for(aggregate),
            self.defaults.document_tag.as_deref(),
        )
    }

    /// Resolves the stream-tag store serving an aggregate. Fails with
    /// [`Config`][crate::error::Error::Config] when no stream-tag store
    /// is configured at all.
    pub fn stream_tag_store(
        &self,
        registry: &AggregateStorageRegistry,
        aggregate: &str,
        requested: Option<&str>,
    ) -> Result<Arc<dyn TagStore>, Error> {
        if self.stream_tags.is_empty() {
            return Err(Error::Config {
                operation: "stream_tag_store",
                message: format!("no stream-tag store is configured (aggregate '{aggregate}')"),
            });
        }

        resolve(
            &self.stream_tags,
            "stream tag store",
            requested,
            registry.store_for(aggregate),
            self.defaults.stream_tag.as_deref(),
        )
    }

    /// Resolves a projection store.
    pub fn projection_store(
        &self,
        requested: Option<&str>,
    ) -> Result<Arc<dyn ProjectionStore>, Error> {
        resolve(
            &self.projections,
            "projection store",
            requested,
            None,
            self.defaults.projection.as_deref(),
        )
    }
}

fn resolve<T: ?Sized>(
    instances: &HashMap<String, Arc<T>>,
    category: &'static str,
    requested: Option<&str>,
    registry_choice: Option<String>,
    default: Option<&str>,
) -> Result<Arc<T>, Error> {
    let name = requested
        .map(str::to_owned)
        .or(registry_choice)
        .or_else(|| default.map(str::to_owned))
        .ok_or_else(|| Error::FactoryMissing {
            category,
            name: "(default)".to_owned(),
        })?;

    instances
        .get(&name)
        .cloned()
        .ok_or(Error::FactoryMissing { category, name })
}
