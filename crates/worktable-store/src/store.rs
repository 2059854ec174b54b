//! The document store seam.
//!
//! Everything above this trait (collection watches, the registry, the
//! mutation gateway) talks to a store only through [`DocumentStore`]. The
//! in-memory implementation lives in [`crate::memory`]; a remote database
//! client would implement the same trait, owning its own reconnect and
//! backoff and reporting blips as [`PushEvent::Interrupted`].
//!
//! [`PushEvent::Interrupted`]: crate::PushEvent::Interrupted

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use worktable_types::{DocumentId, FieldBag, QueryShape, RawDocument};

use crate::error::StoreError;
use crate::push::PushChannel;

/// A query against one collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Query {
    pub collection: String,
    pub shape: QueryShape,
}

impl Query {
    pub fn new(collection: impl Into<String>, shape: QueryShape) -> Self {
        Self {
            collection: collection.into(),
            shape,
        }
    }

    /// The whole collection.
    pub fn all(collection: impl Into<String>) -> Self {
        Self::new(collection, QueryShape::all())
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.collection, self.shape)
    }
}

/// Watch and mutation primitives of a document database.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Open a live watch. The channel yields the initial result set
    /// immediately, then the complete result set again on every change.
    ///
    /// Fails synchronously for queries the store can already tell are
    /// invalid or unauthorized.
    async fn watch(&self, query: Query) -> Result<PushChannel, StoreError>;

    /// One-shot read of a query's current result set.
    async fn list(&self, query: &Query) -> Result<Vec<RawDocument>, StoreError>;

    /// Insert a document, assigning its id and `createdAt`/`updatedAt`.
    async fn create(&self, collection: &str, fields: FieldBag) -> Result<DocumentId, StoreError>;

    /// Merge `fields` into an existing document and bump `updatedAt`.
    async fn update(
        &self,
        collection: &str,
        id: &DocumentId,
        fields: FieldBag,
    ) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &DocumentId) -> Result<(), StoreError>;
}

/// Store handle shared across the registry, gateway and server.
pub type SharedStore = Arc<dyn DocumentStore>;
