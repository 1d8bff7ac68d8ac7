//! The minimal checkpoint contract the engine exposes to projection
//! factories.
//!
//! Projections are opaque blobs to the engine; the only structure it
//! relies on are two reserved top-level JSON keys: `$status` (the
//! [`ProjectionStatus`], absent meaning active) and `$checkpoint` (an
//! opaque fingerprint enabling a write-once external checkpoint object
//! next to the projection).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::store::ProjectionStore;

/// Reserved top-level key carrying the projection status.
pub const STATUS_FIELD: &str = "$status";

/// Reserved top-level key carrying the external checkpoint fingerprint.
pub const CHECKPOINT_FIELD: &str = "$checkpoint";

/// A projection persisted through a
/// [`ProjectionStore`][crate::store::ProjectionStore].
///
/// The serialization format is projection-defined; the engine treats it
/// as opaque bytes apart from the reserved keys above.
pub trait Projection: Serialize + DeserializeOwned + Send + Sync {
    /// Simple name of the projection; the default blob name is
    /// `"{NAME}.json"`.
    const NAME: &'static str;
}

/// Lifecycle status of a projection, stored under
/// [`STATUS_FIELD`] in the projection JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectionStatus {
    /// The projection is up and being materialized.
    #[default]
    Active,
    /// The projection is being rebuilt from scratch.
    Rebuilding,
    /// The projection is turned off.
    Disabled,
}

impl ProjectionStatus {
    /// The stable integer representation stored in projection JSON.
    #[must_use]
    pub fn as_int(self) -> u8 {
        match self {
            ProjectionStatus::Active => 0,
            ProjectionStatus::Rebuilding => 1,
            ProjectionStatus::Disabled => 2,
        }
    }

    /// Reads a status from the `$status` value of a projection JSON
    /// document. Accepts the integer form and the spelled-out form;
    /// anything else (including an absent value) is [`Active`][Self::Active].
    #[must_use]
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        match value {
            Some(serde_json::Value::Number(n)) => match n.as_u64() {
                Some(1) => ProjectionStatus::Rebuilding,
                Some(2) => ProjectionStatus::Disabled,
                _ => ProjectionStatus::Active,
            },
            Some(serde_json::Value::String(s)) => match s.as_str() {
                "Rebuilding" => ProjectionStatus::Rebuilding,
                "Disabled" => ProjectionStatus::Disabled,
                _ => ProjectionStatus::Active,
            },
            _ => ProjectionStatus::Active,
        }
    }
}

/// Typed helpers over the byte-oriented
/// [`ProjectionStore`][crate::store::ProjectionStore] surface.
#[async_trait]
pub trait ProjectionStoreExt: ProjectionStore {
    /// Serializes and saves a typed projection under its default blob
    /// name.
    async fn save_projection<P>(&self, projection: &P) -> Result<(), Error>
    where
        P: Projection + Sync,
    {
        let bytes = serde_json::to_vec(projection).map_err(|err| Error::Backend {
            operation: "save_projection",
            source: anyhow::Error::new(err).context("projection serialization failed"),
        })?;
        self.save(&default_blob_name::<P>(), bytes).await
    }

    /// Loads a typed projection from its default blob name, `None` when
    /// absent.
    async fn load_projection<P>(&self) -> Result<Option<P>, Error>
    where
        P: Projection,
    {
        let Some(bytes) = self.load(&default_blob_name::<P>()).await? else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| Error::Backend {
                operation: "load_projection",
                source: anyhow::Error::new(err).context("projection deserialization failed"),
            })
    }

    /// Loads a typed projection, persisting and returning its default
    /// value when absent.
    async fn get_or_create_projection<P>(&self) -> Result<P, Error>
    where
        P: Projection + Default + Sync,
    {
        if let Some(projection) = self.load_projection::<P>().await? {
            return Ok(projection);
        }

        let fresh = P::default();
        self.save_projection(&fresh).await?;
        Ok(fresh)
    }
}

#[async_trait]
impl<T> ProjectionStoreExt for T where T: ProjectionStore + ?Sized {}

/// The default blob name of a typed projection.
#[must_use]
pub fn default_blob_name<P: Projection>() -> String {
    format!("{}.json", P::NAME)
}
