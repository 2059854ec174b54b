//! Mutation payload rules.
//!
//! Payloads arrive as untyped field bags (HTTP bodies, in-process callers).
//! [`validate`] checks one against the rules for its kind and operation and
//! returns the normalized fields the store should write. A payload that fails
//! here never reaches a store, so it never causes a push.

use serde_json::Value;

use crate::api::MutationOp;
use crate::document::{FieldBag, fields};
use crate::entity::EntityKind;
use crate::ids::DocumentId;

pub const NAME_MAX_CHARS: usize = 64;
pub const DESCRIPTION_MAX_CHARS: usize = 512;

/// Why a mutation payload was refused before reaching the store.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("`{0}` is required")]
    Missing(&'static str),

    #[error("`{0}` must not be blank")]
    Blank(&'static str),

    #[error("`{field}` must be a string")]
    NotAString { field: String },

    #[error("`{field}` must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("`{0}` is assigned by the server")]
    ServerAssigned(String),

    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("update needs at least one field besides `id`")]
    NothingToUpdate,
}

/// A payload that passed [`validate`], normalized for the store.
#[derive(Clone, Debug, PartialEq)]
pub enum ValidatedMutation {
    Create { fields: FieldBag },
    Update { id: DocumentId, fields: FieldBag },
    Delete { id: DocumentId },
}

impl ValidatedMutation {
    pub fn op(&self) -> MutationOp {
        match self {
            ValidatedMutation::Create { .. } => MutationOp::Create,
            ValidatedMutation::Update { .. } => MutationOp::Update,
            ValidatedMutation::Delete { .. } => MutationOp::Delete,
        }
    }
}

/// Fields a client may write for a kind.
fn writable_fields(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Workspace => &[fields::NAME, fields::DESCRIPTION],
        EntityKind::Board => &[fields::NAME, fields::DESCRIPTION, fields::WORKSPACE_ID],
    }
}

/// Check a payload for `kind`/`op` and normalize it.
pub fn validate(
    kind: EntityKind,
    op: MutationOp,
    payload: &FieldBag,
) -> Result<ValidatedMutation, ValidationError> {
    match op {
        MutationOp::Create => validate_create(kind, payload),
        MutationOp::Update => validate_update(kind, payload),
        MutationOp::Delete => validate_delete(payload),
    }
}

fn validate_create(kind: EntityKind, payload: &FieldBag) -> Result<ValidatedMutation, ValidationError> {
    reject_foreign(kind, payload, false)?;

    let mut out = FieldBag::new();
    let name = required_text(payload, fields::NAME)?;
    out.insert(fields::NAME.into(), Value::String(name));

    let description = optional_text(payload, fields::DESCRIPTION, DESCRIPTION_MAX_CHARS)?
        .unwrap_or_default();
    out.insert(fields::DESCRIPTION.into(), Value::String(description));

    if kind == EntityKind::Board {
        let workspace = required_id(payload, fields::WORKSPACE_ID)?;
        out.insert(fields::WORKSPACE_ID.into(), Value::String(workspace.to_string()));
    }

    Ok(ValidatedMutation::Create { fields: out })
}

fn validate_update(kind: EntityKind, payload: &FieldBag) -> Result<ValidatedMutation, ValidationError> {
    reject_foreign(kind, payload, true)?;
    let id = required_id(payload, fields::ID)?;

    let mut out = FieldBag::new();
    if payload.contains_key(fields::NAME) {
        out.insert(fields::NAME.into(), Value::String(required_text(payload, fields::NAME)?));
    }
    if let Some(description) = optional_text(payload, fields::DESCRIPTION, DESCRIPTION_MAX_CHARS)? {
        out.insert(fields::DESCRIPTION.into(), Value::String(description));
    }
    if kind == EntityKind::Board && payload.contains_key(fields::WORKSPACE_ID) {
        let workspace = required_id(payload, fields::WORKSPACE_ID)?;
        out.insert(fields::WORKSPACE_ID.into(), Value::String(workspace.to_string()));
    }

    if out.is_empty() {
        return Err(ValidationError::NothingToUpdate);
    }
    Ok(ValidatedMutation::Update { id, fields: out })
}

fn validate_delete(payload: &FieldBag) -> Result<ValidatedMutation, ValidationError> {
    if let Some(other) = payload.keys().find(|k| k.as_str() != fields::ID) {
        return Err(ValidationError::UnknownField(other.clone()));
    }
    Ok(ValidatedMutation::Delete {
        id: required_id(payload, fields::ID)?,
    })
}

/// Reject server-assigned and unknown fields. `id` is allowed when `with_id`.
fn reject_foreign(kind: EntityKind, payload: &FieldBag, with_id: bool) -> Result<(), ValidationError> {
    let writable = writable_fields(kind);
    for key in payload.keys() {
        let key = key.as_str();
        if with_id && key == fields::ID {
            continue;
        }
        if fields::SERVER_ASSIGNED.contains(&key) {
            return Err(ValidationError::ServerAssigned(key.to_string()));
        }
        if !writable.contains(&key) {
            return Err(ValidationError::UnknownField(key.to_string()));
        }
    }
    Ok(())
}

fn text<'a>(payload: &'a FieldBag, field: &'static str) -> Result<Option<&'a str>, ValidationError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ValidationError::NotAString {
            field: field.to_string(),
        }),
    }
}

/// Required, trimmed, non-blank name-like text.
fn required_text(payload: &FieldBag, field: &'static str) -> Result<String, ValidationError> {
    let raw = text(payload, field)?.ok_or(ValidationError::Missing(field))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Blank(field));
    }
    if trimmed.chars().count() > NAME_MAX_CHARS {
        return Err(ValidationError::TooLong {
            field,
            max: NAME_MAX_CHARS,
        });
    }
    Ok(trimmed.to_string())
}

fn optional_text(
    payload: &FieldBag,
    field: &'static str,
    max: usize,
) -> Result<Option<String>, ValidationError> {
    let Some(raw) = text(payload, field)? else {
        return Ok(None);
    };
    if raw.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(Some(raw.to_string()))
}

fn required_id(payload: &FieldBag, field: &'static str) -> Result<DocumentId, ValidationError> {
    let raw = text(payload, field)?.ok_or(ValidationError::Missing(field))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Blank(field));
    }
    Ok(DocumentId::new(trimmed))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> FieldBag {
        match value {
            Value::Object(m) => m,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn test_create_workspace_normalizes() {
        let v = validate(
            EntityKind::Workspace,
            MutationOp::Create,
            &bag(json!({ "name": "  Ops ", "description": "ops team" })),
        )
        .unwrap();
        let ValidatedMutation::Create { fields } = v else {
            panic!("expected create");
        };
        assert_eq!(fields["name"], "Ops");
        assert_eq!(fields["description"], "ops team");
    }

    #[test]
    fn test_create_defaults_description() {
        let v = validate(
            EntityKind::Workspace,
            MutationOp::Create,
            &bag(json!({ "name": "Ops" })),
        )
        .unwrap();
        let ValidatedMutation::Create { fields } = v else {
            panic!("expected create");
        };
        assert_eq!(fields["description"], "");
    }

    #[test]
    fn test_create_missing_name() {
        let err = validate(
            EntityKind::Workspace,
            MutationOp::Create,
            &bag(json!({ "description": "x" })),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Missing("name"));
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_create_blank_name() {
        let err = validate(
            EntityKind::Workspace,
            MutationOp::Create,
            &bag(json!({ "name": "   " })),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Blank("name"));
    }

    #[test]
    fn test_create_name_too_long() {
        let long = "x".repeat(NAME_MAX_CHARS + 1);
        let err = validate(
            EntityKind::Workspace,
            MutationOp::Create,
            &bag(json!({ "name": long })),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::TooLong { field: "name", .. }));
    }

    #[test]
    fn test_create_board_requires_workspace() {
        let err = validate(
            EntityKind::Board,
            MutationOp::Create,
            &bag(json!({ "name": "Sprint" })),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Missing("workspaceId"));

        let ok = validate(
            EntityKind::Board,
            MutationOp::Create,
            &bag(json!({ "name": "Sprint", "workspaceId": "ws-1" })),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_server_assigned_fields_rejected() {
        for field in ["id", "createdAt", "updatedAt"] {
            let mut payload = bag(json!({ "name": "Ops" }));
            payload.insert(field.to_string(), json!(1));
            let err = validate(EntityKind::Workspace, MutationOp::Create, &payload).unwrap_err();
            assert_eq!(err, ValidationError::ServerAssigned(field.to_string()));
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = validate(
            EntityKind::Workspace,
            MutationOp::Create,
            &bag(json!({ "name": "Ops", "workspaceId": "w" })),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::UnknownField("workspaceId".into()));
    }

    #[test]
    fn test_update_requires_id_and_a_field() {
        let err = validate(
            EntityKind::Workspace,
            MutationOp::Update,
            &bag(json!({ "name": "x" })),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Missing("id"));

        let err = validate(
            EntityKind::Workspace,
            MutationOp::Update,
            &bag(json!({ "id": "w1" })),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::NothingToUpdate);

        let v = validate(
            EntityKind::Workspace,
            MutationOp::Update,
            &bag(json!({ "id": "w1", "description": "" })),
        )
        .unwrap();
        assert_eq!(v.op(), MutationOp::Update);
    }

    #[test]
    fn test_delete_takes_only_id() {
        let v = validate(EntityKind::Board, MutationOp::Delete, &bag(json!({ "id": "b1" }))).unwrap();
        assert_eq!(
            v,
            ValidatedMutation::Delete {
                id: DocumentId::new("b1")
            }
        );
        let err = validate(
            EntityKind::Board,
            MutationOp::Delete,
            &bag(json!({ "id": "b1", "name": "x" })),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::UnknownField("name".into()));
    }
}
