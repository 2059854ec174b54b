//! Shared document and entity types for worktable.
//!
//! This crate is the leaf of the workspace: typed document ids, the raw
//! documents a store pushes, the typed entities they are transformed into,
//! query shapes, mutation payload rules and the HTTP response envelope. It
//! has **no internal worktable dependencies**.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! Workspace (DocumentId)
//!     └── referenced by Board.workspace_id (weak: an id, never a pointer)
//!
//! RawDocument (DocumentId + FieldBag) ── Entity::from_document ──▶ Workspace | Board
//! ```
//!
//! # Key Types
//!
//! |-----------------------|----------------------------------------------|
//! | Type                  | Purpose                                      |
//! |-----------------------|----------------------------------------------|
//! | [`DocumentId`]        | Store-assigned, immutable document identity  |
//! | [`RawDocument`]       | Opaque field bag as pushed by the store      |
//! | [`Entity`]            | Typed, fully reconstructed domain value      |
//! | [`EntityKind`]        | Which collection an entity lives in          |
//! | [`MalformedDocument`] | Transform failure for one document           |
//! | [`QueryShape`]        | Equality filters identifying a watched query |
//! | [`ApiResponse`]       | `{status, data?, error?}` HTTP envelope      |
//! |-----------------------|----------------------------------------------|

pub mod api;
pub mod document;
pub mod entity;
pub mod ids;
pub mod query;
pub mod schema;
pub mod transform;

pub use api::{API_PREFIX, ApiResponse, MutationData, MutationOp};
pub use document::{FieldBag, RawDocument, Timestamp, fields, now_millis};
pub use entity::{Board, Entity, EntityKind, Workspace};
pub use ids::DocumentId;
pub use query::QueryShape;
pub use schema::{ValidatedMutation, ValidationError, validate};
pub use transform::{FieldProblem, MalformedDocument};
