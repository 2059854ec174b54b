//! Live collection synchronization for worktable.
//!
//! Keeps in-memory state consistent with a document store through
//! server-push watches, and governs how many watches exist:
//!
//! - [`CollectionWatch`]: one store watch turned into a typed entity stream
//!   with an idempotent teardown.
//! - [`SubscriptionRegistry`]: at most one live watch per
//!   `(entity kind, query shape)`, shared by refcounted [`Interest`]s.
//! - [`CollectionView`]: an interest's events folded into the current set.
//! - [`MutationGateway`]: create/update/delete over the store or HTTP;
//!   effects show up only through the next push.

pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod registry;
pub mod view;
pub mod watch;

pub use config::{ClientConfig, DEFAULT_BASE_URL};
pub use error::{MutationRejected, SubscriptionError};
pub use event::{SyncEvent, SyncGeneration};
pub use gateway::{HttpTransport, MutationGateway, MutationOutcome, MutationTransport, StoreTransport};
pub use registry::{DEFAULT_INTEREST_BUFFER, Interest, SubscriptionKey, SubscriptionRegistry};
pub use view::CollectionView;
pub use watch::{CollectionWatch, EntitySink, WatchHandle};
