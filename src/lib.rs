//! `chainstream` is a storage engine for Event Sourcing over object
//! stores: append-only, per-aggregate event streams with optimistic
//! concurrency through a cryptographic hash chain, pluggable backends,
//! a document-tag secondary index, and idempotent rollback of failed
//! commits.
//!
//! The building blocks:
//!
//! * [`event`]: the unit of change, with the reserved stream-closing
//!   event type and event-name derivation.
//! * [`document`]: the per-aggregate [`ObjectDocument`] anchoring the
//!   active stream, terminated streams, hash chain, chunking and
//!   snapshot metadata.
//! * [`hash`]: commit fingerprints, the hash chain and the wildcard
//!   sentinel disabling concurrency checks.
//! * [`backend`]: the abstract object-store contract adapters
//!   implement, plus the embedded in-memory backend.
//! * [`store`]: the data, document, tag and projection store contracts
//!   the engine consumes.
//! * [`objectstore`]: the object-store adapter family implementing
//!   those contracts over any [`backend::Backend`].
//! * [`registry`]: named store instances, per-aggregate routing and
//!   default resolution.
//! * [`stream`]: the [`EventStreams`] engine and its append
//!   [`Session`].
//! * [`projection`]: the minimal checkpoint contract exposed to
//!   projection factories.
//! * [`error`]: the stable-coded failure taxonomy.
//!
//! A minimal setup wires a backend into the adapter family, registers
//! the adapters under a name, and opens sessions through the engine:
//!
//! ```
//! use std::sync::Arc;
//!
//! use chainstream::backend::InMemoryBackend;
//! use chainstream::document::StoreSelection;
//! use chainstream::event::Event;
//! use chainstream::objectstore::{
//!     ContainerVerification, ObjectDataStore, ObjectDocumentStore, ObjectStoreConfig,
//!     ObjectTagStore,
//! };
//! use chainstream::registry::{AggregateStorageRegistry, Stores};
//! use chainstream::store::{DocumentStore, TagKind, UuidIdProvider};
//! use chainstream::stream::EventStreams;
//!
//! # async fn example() -> Result<(), chainstream::error::Error> {
//! let backend = Arc::new(InMemoryBackend::new());
//! let config = ObjectStoreConfig::default();
//! let verification = Arc::new(ContainerVerification::new());
//!
//! let tags = Arc::new(ObjectTagStore::new(
//!     backend.clone(),
//!     config,
//!     verification.clone(),
//!     TagKind::Document,
//! ));
//! let documents = Arc::new(ObjectDocumentStore::new(
//!     backend.clone(),
//!     config,
//!     verification.clone(),
//!     StoreSelection::single_store("object-store", "memory"),
//!     Arc::new(UuidIdProvider),
//!     tags.clone(),
//! ));
//! let data = Arc::new(ObjectDataStore::new(backend, config, verification));
//!
//! let stores = Arc::new(
//!     Stores::new()
//!         .with_data_store("memory", data)
//!         .with_document_store("memory", documents.clone())
//!         .with_document_tag_store("memory", tags),
//! );
//! let registry = Arc::new(AggregateStorageRegistry::new());
//! let engine = EventStreams::new(stores, registry);
//!
//! let document = documents.get_or_create("users", "u1").await?;
//! let mut session = engine.open_session(document)?;
//! session.append(Event::new("User.Created", serde_json::json!({"name": "A"})))?;
//! let document = session.commit().await?;
//!
//! assert_eq!(0, document.active.current_stream_version);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod document;
pub mod error;
pub mod event;
pub mod hash;
pub mod objectstore;
pub mod projection;
pub mod registry;
pub mod store;
pub mod stream;

pub use crate::document::ObjectDocument;
pub use crate::error::Error;
pub use crate::event::Event;
pub use crate::stream::{EventStreams, Session};
