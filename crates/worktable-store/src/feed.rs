//! Change feed: the store's internal pub/sub for document changes.
//!
//! Every mutation, access change and transport interruption is published
//! with a subject of the form `{collection}.{change}`, for example
//! `workspaces.created` or `boards.interrupted`. Watch tasks subscribe with a
//! NATS-style pattern and recompute their result set on each message.
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `boards.*` matches `boards.created`
//! - `>` matches one or more tokens (only at end): `>` matches everything
//! - Exact match: `boards.deleted` only matches `boards.deleted`

use std::time::Instant;

use strum::{AsRefStr, Display};
use tokio::sync::broadcast;

use worktable_types::DocumentId;

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            // `>` must be last and swallows the rest
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Change Events
// ============================================================================

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    /// Access to the collection was revoked or restored.
    Access,
    /// The transport blipped; watchers must resync.
    Interrupted,
}

/// One message on the change feed.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    /// `{collection}.{kind}`.
    pub subject: String,
    pub collection: String,
    pub kind: ChangeKind,
    /// Affected document, for document changes.
    pub document: Option<DocumentId>,
    /// Free-form detail (interruption reason).
    pub detail: Option<String>,
    pub timestamp: Instant,
}

impl ChangeEvent {
    pub fn new(collection: impl Into<String>, kind: ChangeKind) -> Self {
        let collection = collection.into();
        Self {
            subject: format!("{collection}.{kind}"),
            collection,
            kind,
            document: None,
            detail: None,
            timestamp: Instant::now(),
        }
    }

    pub fn with_document(mut self, id: DocumentId) -> Self {
        self.document = Some(id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ============================================================================
// ChangeFeed
// ============================================================================

/// Broadcast bus for [`ChangeEvent`]s.
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
    capacity: usize,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns how many subscribers saw it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events whose subject matches `pattern`.
    pub fn subscribe(&self, pattern: &str) -> FeedSubscription {
        FeedSubscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Why [`FeedSubscription::recv`] returned without an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FeedRecvError {
    /// The subscriber fell behind and missed this many events. Anything
    /// derived from the feed must be recomputed.
    #[error("change feed lagged by {0} events")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// A pattern-filtered subscription to a [`ChangeFeed`].
pub struct FeedSubscription {
    pattern: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl FeedSubscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching event.
    pub async fn recv(&mut self) -> Result<ChangeEvent, FeedRecvError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if matches_pattern(&self.pattern, &event.subject) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedRecvError::Closed),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, lagged = n, "change feed subscription lagged");
                    return Err(FeedRecvError::Lagged(n));
                }
            }
        }
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
