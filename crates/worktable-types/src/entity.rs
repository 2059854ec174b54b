//! Typed domain entities.
//!
//! Every entity is rebuilt from scratch from the complete document on each
//! push; there is no partial-update path. Relations between kinds are plain
//! ids (`Board::workspace_id`) resolved by lookup, never owned references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::document::{RawDocument, Timestamp, fields};
use crate::ids::DocumentId;
use crate::transform::{FieldReader, MalformedDocument};

/// Which kind of entity (and therefore which store collection).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum EntityKind {
    #[strum(serialize = "workspace", serialize = "workspaces")]
    Workspace,
    #[strum(serialize = "board", serialize = "boards")]
    Board,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Workspace, EntityKind::Board];

    /// Parse from a path segment or collection name (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Singular name, as used in HTTP resource paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Workspace => "workspace",
            EntityKind::Board => "board",
        }
    }

    /// Store collection holding documents of this kind.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Workspace => "workspaces",
            EntityKind::Board => "boards",
        }
    }

    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.collection() == collection)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed value reconstructed from one [`RawDocument`].
///
/// `from_document` must be pure: no I/O, no defaults for missing required
/// fields. A document that cannot be read yields [`MalformedDocument`].
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    fn from_document(doc: &RawDocument) -> Result<Self, MalformedDocument>;

    fn id(&self) -> &DocumentId;
}

/// A workspace: the top-level container boards belong to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: DocumentId,
    pub name: String,
    pub description: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Entity for Workspace {
    const KIND: EntityKind = EntityKind::Workspace;

    fn from_document(doc: &RawDocument) -> Result<Self, MalformedDocument> {
        let r = FieldReader::new(Self::KIND, doc)?;
        Ok(Self {
            id: doc.id.clone(),
            name: r.string(fields::NAME)?,
            description: r.string(fields::DESCRIPTION)?,
            created_at: r.timestamp(fields::CREATED_AT)?,
            updated_at: r.timestamp(fields::UPDATED_AT)?,
        })
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }
}

/// A task board inside a workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: DocumentId,
    pub name: String,
    pub description: String,
    /// Owning workspace. Relation only: the workspace may not be loaded,
    /// or may have been deleted since.
    pub workspace_id: DocumentId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Entity for Board {
    const KIND: EntityKind = EntityKind::Board;

    fn from_document(doc: &RawDocument) -> Result<Self, MalformedDocument> {
        let r = FieldReader::new(Self::KIND, doc)?;
        Ok(Self {
            id: doc.id.clone(),
            name: r.string(fields::NAME)?,
            description: r.string(fields::DESCRIPTION)?,
            workspace_id: r.id(fields::WORKSPACE_ID)?,
            created_at: r.timestamp(fields::CREATED_AT)?,
            updated_at: r.timestamp(fields::UPDATED_AT)?,
        })
    }

    fn id(&self) -> &DocumentId {
        &self.id
    }
}

// ============================================================================
// Tests
// ============================================================================
