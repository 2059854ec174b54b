//! Events delivered to subscription consumers.

use worktable_types::MalformedDocument;

use crate::error::SubscriptionError;

/// Monotonic per-watch push counter.
///
/// Bumped once per pushed snapshot; consumers compare generations to tell a
/// fresh resync from stale data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncGeneration(pub u64);

impl SyncGeneration {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// One item on an interest's channel.
///
/// A push arrives as its entities and malformed documents in store order,
/// then exactly one `SnapshotComplete`. `Terminated` is always last.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent<E> {
    Entity(E),
    Malformed(MalformedDocument),
    SnapshotComplete(SyncGeneration),
    Terminated(SubscriptionError),
}

impl<E> SyncEvent<E> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncEvent::Terminated(_))
    }
}
