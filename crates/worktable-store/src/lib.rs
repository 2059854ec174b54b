//! Document store seam for worktable.
//!
//! [`DocumentStore`] is the boundary to the database: a "watch this query,
//! get the full result set on every change" primitive plus create, update
//! and delete. Watches deliver over a [`PushChannel`] whose
//! [`unsubscribe`](PushChannel::unsubscribe) guarantees silence afterwards.
//!
//! [`MemoryStore`] implements the seam in-process and is what the server and
//! the tests run against.

pub mod error;
pub mod feed;
pub mod memory;
pub mod push;
pub mod store;

pub use error::StoreError;
pub use feed::{ChangeEvent, ChangeFeed, ChangeKind, FeedRecvError, FeedSubscription, matches_pattern};
pub use memory::{DEFAULT_COLLECTIONS, MemoryStore, MemoryStoreConfig};
pub use push::{PushChannel, PushEvent, PushSender, push_channel};
pub use store::{DocumentStore, Query, SharedStore};
