//! HTTP wire contract shared by the server and the HTTP mutation transport.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::entity::EntityKind;
use crate::ids::DocumentId;

/// Path prefix of every task-management endpoint.
pub const API_PREFIX: &str = "/api/tasks-management";

/// Mutation operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    /// Request path for this operation on `kind`, relative to the host.
    ///
    /// Create posts to the collection itself; update and delete have their
    /// own sub-path.
    pub fn path(&self, kind: EntityKind) -> String {
        match self {
            MutationOp::Create => format!("{API_PREFIX}/{kind}"),
            MutationOp::Update | MutationOp::Delete => format!("{API_PREFIX}/{kind}/{self}"),
        }
    }
}

/// Response envelope: `{status, data?, error?}`.
///
/// `status` always agrees with the HTTP status class; `error` is set iff
/// `status` is false.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// `data` payload of a mutation response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DocumentId>,
}
