//! Field-level document reading shared by every [`Entity`](crate::Entity).
//!
//! Reads are strict: a required field that is absent or has the wrong JSON
//! type is a [`MalformedDocument`], never a default.

use std::fmt;

use serde_json::Value;

use crate::document::{RawDocument, Timestamp, fields};
use crate::entity::EntityKind;
use crate::ids::DocumentId;

/// What was wrong with a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    NotAString,
    /// Present but empty where a non-empty value is required (ids).
    Empty,
    /// Not a non-negative integer (timestamps).
    NotATimestamp,
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldProblem::Missing => "missing",
            FieldProblem::NotAString => "not a string",
            FieldProblem::Empty => "empty",
            FieldProblem::NotATimestamp => "not a non-negative integer timestamp",
        };
        f.write_str(s)
    }
}

/// A pushed document that could not be turned into its entity.
///
/// Skips exactly one document; the rest of the push is still delivered.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed {kind} document {document_id}: field `{field}` {problem}")]
pub struct MalformedDocument {
    pub kind: EntityKind,
    pub document_id: DocumentId,
    pub field: &'static str,
    pub problem: FieldProblem,
}

/// Typed accessor over one document's field bag.
pub(crate) struct FieldReader<'a> {
    kind: EntityKind,
    doc: &'a RawDocument,
}

impl<'a> FieldReader<'a> {
    /// Fails up front if the document has no usable id.
    pub(crate) fn new(kind: EntityKind, doc: &'a RawDocument) -> Result<Self, MalformedDocument> {
        let reader = Self { kind, doc };
        if doc.id.is_empty() {
            return Err(reader.problem(fields::ID, FieldProblem::Empty));
        }
        Ok(reader)
    }

    fn problem(&self, field: &'static str, problem: FieldProblem) -> MalformedDocument {
        MalformedDocument {
            kind: self.kind,
            document_id: self.doc.id.clone(),
            field,
            problem,
        }
    }

    fn required(&self, field: &'static str) -> Result<&'a Value, MalformedDocument> {
        match self.doc.get(field) {
            None | Some(Value::Null) => Err(self.problem(field, FieldProblem::Missing)),
            Some(v) => Ok(v),
        }
    }

    /// A required string. Empty strings are allowed.
    pub(crate) fn string(&self, field: &'static str) -> Result<String, MalformedDocument> {
        self.required(field)?
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| self.problem(field, FieldProblem::NotAString))
    }

    /// A required, non-empty id reference.
    pub(crate) fn id(&self, field: &'static str) -> Result<DocumentId, MalformedDocument> {
        let s = self.string(field)?;
        if s.is_empty() {
            return Err(self.problem(field, FieldProblem::Empty));
        }
        Ok(DocumentId::from(s))
    }

    pub(crate) fn timestamp(&self, field: &'static str) -> Result<Timestamp, MalformedDocument> {
        self.required(field)?
            .as_u64()
            .ok_or_else(|| self.problem(field, FieldProblem::NotATimestamp))
    }
}

// ============================================================================
// Tests
// ============================================================================
