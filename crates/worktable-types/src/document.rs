//! Raw documents as the store pushes them.
//!
//! A [`RawDocument`] is an id plus an opaque JSON field bag. Nothing about its
//! fields is trusted until [`Entity::from_document`](crate::Entity::from_document)
//! has checked them.

use serde::{Deserialize, Serialize};

use crate::ids::DocumentId;

/// Untyped document fields, keyed by wire (camelCase) field name.
pub type FieldBag = serde_json::Map<String, serde_json::Value>;

/// Server-assigned time, Unix milliseconds.
pub type Timestamp = u64;

/// Wire names of the fields the entity kinds use.
pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const WORKSPACE_ID: &str = "workspaceId";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";

    /// Fields only the store may write.
    pub const SERVER_ASSIGNED: [&str; 3] = [ID, CREATED_AT, UPDATED_AT];
}

/// One document of a pushed result set: identity plus field bag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: DocumentId,
    pub fields: FieldBag,
}

impl RawDocument {
    pub fn new(id: impl Into<DocumentId>, fields: FieldBag) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Look up a field by wire name.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }
}

/// Current time as Unix millis.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
