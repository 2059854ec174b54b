//! Client error types.

use worktable_store::StoreError;
use worktable_types::ValidationError;

/// Terminal failure of a subscription.
///
/// Delivered once to every interest as `SyncEvent::Terminated`, or returned
/// from `acquire` when the watch could not be established. Re-acquire to
/// retry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The store refused the query (invalid, unknown collection, or
    /// unauthorized).
    #[error("store rejected the query: {0}")]
    Rejected(StoreError),

    /// The watch could not be established or its channel closed.
    #[error("watch unavailable: {0}")]
    Unavailable(String),

    #[error("subscription registry shut down")]
    Shutdown,

    /// A subscription key is already held by a different entity type.
    #[error("subscription {key} is held by a different entity type")]
    KindMismatch { key: String },
}

impl From<StoreError> for SubscriptionError {
    fn from(err: StoreError) -> Self {
        if err.is_refusal() {
            SubscriptionError::Rejected(err)
        } else {
            SubscriptionError::Unavailable(err.to_string())
        }
    }
}

/// Why a mutation was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum MutationRejected {
    #[error("invalid payload: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The server answered with a failure status and a failure envelope.
    #[error("server refused ({status}): {detail}")]
    Http { status: u16, detail: String },

    /// HTTP status and envelope `status` disagree, or the body is unreadable.
    #[error("inconsistent response ({status}): {detail}")]
    Inconsistent { status: u16, detail: String },

    #[error("transport error: {0}")]
    Transport(String),
}
