//! In-memory document store.
//!
//! Collections are insertion-ordered maps held in a `DashMap`. Every
//! mutation is published on the [`ChangeFeed`]; each watch runs one pump task
//! that recomputes its query's result set on relevant changes and pushes it
//! only when it actually changed.
//!
//! The store also models the failure modes a remote database has:
//! [`deny`](MemoryStore::deny) revokes access (live watches get a terminal
//! `Rejected`), and [`interrupt`](MemoryStore::interrupt) simulates a
//! transport blip (live watches get `Interrupted` followed by a full resync).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use worktable_types::{DocumentId, FieldBag, RawDocument, Timestamp, fields, now_millis};

use crate::error::StoreError;
use crate::feed::{ChangeEvent, ChangeFeed, ChangeKind, FeedRecvError, FeedSubscription};
use crate::push::{PushChannel, PushEvent, PushSender, push_channel};
use crate::store::{DocumentStore, Query, SharedStore};

/// Collections served when none are configured.
pub const DEFAULT_COLLECTIONS: [&str; 2] = ["workspaces", "boards"];

/// Sizing and layout of a [`MemoryStore`].
#[derive(Clone, Debug)]
pub struct MemoryStoreConfig {
    pub collections: Vec<String>,
    /// Slots per watch push channel.
    pub push_buffer: usize,
    /// Change feed capacity before slow watchers lag.
    pub feed_capacity: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            push_buffer: 64,
            feed_capacity: 1024,
        }
    }
}

type Collection = IndexMap<DocumentId, FieldBag>;

struct WatchEntry {
    query: Query,
    token: CancellationToken,
}

struct Inner {
    collections: DashMap<String, Collection>,
    denied: DashSet<String>,
    feed: ChangeFeed,
    watches: DashMap<u64, WatchEntry>,
    next_watch: AtomicU64,
    clock: AtomicU64,
    push_buffer: usize,
}

/// Cheaply cloneable handle to one in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collections", &self.inner.collections.len())
            .field("watches", &self.inner.watches.len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let collections = DashMap::new();
        for name in config.collections {
            collections.insert(name, Collection::new());
        }
        Self {
            inner: Arc::new(Inner {
                collections,
                denied: DashSet::new(),
                feed: ChangeFeed::new(config.feed_capacity),
                watches: DashMap::new(),
                next_watch: AtomicU64::new(1),
                clock: AtomicU64::new(0),
                push_buffer: config.push_buffer,
            }),
        }
    }

    /// This store as a trait object.
    pub fn shared(&self) -> SharedStore {
        Arc::new(self.clone())
    }

    /// Revoke access to a collection. Live watches on it are rejected.
    pub fn deny(&self, collection: &str) {
        if self.inner.denied.insert(collection.to_string()) {
            tracing::info!(collection, "access revoked");
            self.inner
                .feed
                .publish(ChangeEvent::new(collection, ChangeKind::Access));
        }
    }

    /// Restore access revoked by [`deny`](Self::deny).
    pub fn allow(&self, collection: &str) {
        if self.inner.denied.remove(collection).is_some() {
            tracing::info!(collection, "access restored");
            self.inner
                .feed
                .publish(ChangeEvent::new(collection, ChangeKind::Access));
        }
    }

    /// Simulate a transport interruption on every collection.
    pub fn interrupt(&self, reason: &str) {
        tracing::info!(reason, "simulated transport interruption");
        let names: Vec<String> = self
            .inner
            .collections
            .iter()
            .map(|c| c.key().clone())
            .collect();
        for name in names {
            self.inner
                .feed
                .publish(ChangeEvent::new(name, ChangeKind::Interrupted).with_detail(reason));
        }
    }

    /// Number of watches whose channel is still open.
    pub fn active_watches(&self) -> usize {
        self.inner
            .watches
            .iter()
            .filter(|w| !w.token.is_cancelled())
            .count()
    }

    /// Number of open watches on exactly `query`.
    pub fn active_watches_for(&self, query: &Query) -> usize {
        self.inner
            .watches
            .iter()
            .filter(|w| !w.token.is_cancelled() && &w.query == query)
            .count()
    }

    /// Total watches ever opened.
    pub fn watches_opened(&self) -> u64 {
        self.inner.next_watch.load(Ordering::SeqCst) - 1
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> Result<usize, StoreError> {
        self.inner
            .collections
            .get(collection)
            .map(|c| c.len())
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }

    /// Store a document verbatim, bypassing field stripping and timestamps.
    ///
    /// For seeding data written by other clients (including malformed
    /// documents). Replaces any document with the same id.
    pub fn put_raw(&self, collection: &str, doc: RawDocument) -> Result<(), StoreError> {
        {
            let mut coll = self
                .inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
            coll.insert(doc.id.clone(), doc.fields);
        }
        self.inner
            .feed
            .publish(ChangeEvent::new(collection, ChangeKind::Created).with_document(doc.id));
        Ok(())
    }
}

impl Inner {
    fn check_collection(&self, collection: &str) -> Result<(), StoreError> {
        if !self.collections.contains_key(collection) {
            return Err(StoreError::UnknownCollection(collection.to_string()));
        }
        if self.denied.contains(collection) {
            return Err(StoreError::PermissionDenied(collection.to_string()));
        }
        Ok(())
    }

    fn check_query(&self, query: &Query) -> Result<(), StoreError> {
        self.check_collection(&query.collection)?;
        for (field, _) in query.shape.filters() {
            if field.is_empty() || field.contains('.') || field.contains(char::is_whitespace) {
                return Err(StoreError::InvalidQuery(format!(
                    "bad filter field `{field}` on {}",
                    query.collection
                )));
            }
        }
        Ok(())
    }

    /// Current result set of `query`, in store order.
    fn snapshot(&self, query: &Query) -> Result<Vec<RawDocument>, StoreError> {
        self.check_query(query)?;
        let coll = self
            .collections
            .get(&query.collection)
            .ok_or_else(|| StoreError::UnknownCollection(query.collection.clone()))?;
        Ok(coll
            .iter()
            .filter(|(_, fields)| query.shape.matches(fields))
            .map(|(id, fields)| RawDocument::new(id.clone(), fields.clone()))
            .collect())
    }

    /// Strictly increasing server time.
    fn next_timestamp(&self) -> Timestamp {
        let now = now_millis();
        let prev = match self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            }) {
            Ok(p) | Err(p) => p,
        };
        now.max(prev + 1)
    }

    async fn pump(
        self: Arc<Self>,
        watch_id: u64,
        query: Query,
        mut changes: FeedSubscription,
        tx: PushSender,
    ) {
        let mut last: Option<Vec<RawDocument>> = None;
        let mut force = true;

        loop {
            match self.snapshot(&query) {
                Ok(docs) => {
                    if force || last.as_ref() != Some(&docs) {
                        tracing::trace!(documents = docs.len(), "pushing snapshot");
                        if !tx.send(PushEvent::Snapshot(docs.clone())).await {
                            break;
                        }
                        last = Some(docs);
                    }
                }
                Err(err) => {
                    tracing::info!(error = %err, "watch rejected");
                    tx.send(PushEvent::Rejected(err)).await;
                    break;
                }
            }
            force = false;

            let change = tokio::select! {
                biased;
                _ = tx.cancelled() => break,
                change = changes.recv() => change,
            };
            match change {
                Ok(event) if event.kind == ChangeKind::Interrupted => {
                    let reason = event.detail.unwrap_or_default();
                    if !tx.send(PushEvent::Interrupted { reason }).await {
                        break;
                    }
                    force = true;
                }
                // Anything else (including lag) just means "recompute".
                Ok(_) | Err(FeedRecvError::Lagged(_)) => {}
                Err(FeedRecvError::Closed) => break,
            }
        }

        self.watches.remove(&watch_id);
        tracing::debug!("watch pump finished");
    }
}

fn strip_server_assigned(fields: &mut FieldBag) {
    for key in fields::SERVER_ASSIGNED {
        fields.remove(key);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn watch(&self, query: Query) -> Result<PushChannel, StoreError> {
        self.inner.check_query(&query)?;

        // Subscribe before the first snapshot so no change slips between.
        let changes = self.inner.feed.subscribe(&format!("{}.*", query.collection));
        let (tx, channel) = push_channel(self.inner.push_buffer);
        let watch_id = self.inner.next_watch.fetch_add(1, Ordering::SeqCst);
        self.inner.watches.insert(
            watch_id,
            WatchEntry {
                query: query.clone(),
                token: tx.token(),
            },
        );

        tracing::debug!(watch_id, query = %query, "watch opened");
        let span = tracing::debug_span!("watch.pump", watch_id, query = %query);
        tokio::spawn(
            Arc::clone(&self.inner)
                .pump(watch_id, query, changes, tx)
                .instrument(span),
        );
        Ok(channel)
    }

    async fn list(&self, query: &Query) -> Result<Vec<RawDocument>, StoreError> {
        self.inner.snapshot(query)
    }

    async fn create(&self, collection: &str, mut fields: FieldBag) -> Result<DocumentId, StoreError> {
        self.inner.check_collection(collection)?;
        strip_server_assigned(&mut fields);

        let now = self.inner.next_timestamp();
        fields.insert(fields::CREATED_AT.into(), Value::from(now));
        fields.insert(fields::UPDATED_AT.into(), Value::from(now));

        let id = DocumentId::generate();
        {
            let mut coll = self
                .inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
            coll.insert(id.clone(), fields);
        }

        tracing::debug!(collection, id = %id, "document created");
        self.inner
            .feed
            .publish(ChangeEvent::new(collection, ChangeKind::Created).with_document(id.clone()));
        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        id: &DocumentId,
        mut fields: FieldBag,
    ) -> Result<(), StoreError> {
        self.inner.check_collection(collection)?;
        strip_server_assigned(&mut fields);

        let now = self.inner.next_timestamp();
        {
            let mut coll = self
                .inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
            let doc = coll.get_mut(id).ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.clone(),
            })?;
            doc.extend(fields);
            doc.insert(fields::UPDATED_AT.into(), Value::from(now));
        }

        tracing::debug!(collection, id = %id, "document updated");
        self.inner
            .feed
            .publish(ChangeEvent::new(collection, ChangeKind::Updated).with_document(id.clone()));
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &DocumentId) -> Result<(), StoreError> {
        self.inner.check_collection(collection)?;
        {
            let mut coll = self
                .inner
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
            coll.shift_remove(id).ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.clone(),
            })?;
        }

        tracing::debug!(collection, id = %id, "document deleted");
        self.inner
            .feed
            .publish(ChangeEvent::new(collection, ChangeKind::Deleted).with_document(id.clone()));
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
