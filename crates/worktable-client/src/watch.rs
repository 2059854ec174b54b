//! Collection watch: one store push subscription turned into a typed entity
//! stream with a single idempotent teardown.
//!
//! The sink lives in a gate (`Mutex<Option<S>>`). The pump task delivers a
//! whole push while holding the gate; teardown takes the sink out of it. So
//! once [`WatchHandle::teardown`] returns, no delivery is running and none can
//! start, including for a push that was already in flight.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use worktable_store::{PushChannel, PushEvent, Query, SharedStore};
use worktable_types::{Entity, MalformedDocument, QueryShape};

use crate::error::SubscriptionError;
use crate::event::{SyncEvent, SyncGeneration};

/// Receiver of a watch's transformed pushes.
///
/// Called from the pump task with the gate held: implementations must not
/// block and must not call back into the watch.
pub trait EntitySink<E: Entity>: Send + Sync + 'static {
    /// One complete push, transformed, in store order.
    fn on_snapshot(&self, items: Vec<Result<E, MalformedDocument>>, generation: SyncGeneration);

    /// The watch ended on its own. Nothing follows.
    fn on_terminated(&self, error: SubscriptionError);
}

/// Direct consumer sink. A push is queued whole or skipped whole, so size
/// the channel for the largest expected result set; the next push is a full
/// resync anyway.
impl<E: Entity> EntitySink<E> for mpsc::Sender<SyncEvent<E>> {
    fn on_snapshot(&self, items: Vec<Result<E, MalformedDocument>>, generation: SyncGeneration) {
        if self.capacity() < items.len() + 1 {
            tracing::warn!(generation = generation.0, documents = items.len(), "sink full, push skipped");
            return;
        }
        for item in items {
            let event = match item {
                Ok(entity) => SyncEvent::Entity(entity),
                Err(malformed) => SyncEvent::Malformed(malformed),
            };
            if self.try_send(event).is_err() {
                return;
            }
        }
        let _ = self.try_send(SyncEvent::SnapshotComplete(generation));
    }

    fn on_terminated(&self, error: SubscriptionError) {
        if let Err(TrySendError::Full(event)) = self.try_send(SyncEvent::Terminated(error)) {
            let tx = self.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

/// Type-erased side of the gate, so handles are not generic over the sink.
trait Gate: Send + Sync {
    fn close(&self);
    fn is_open(&self) -> bool;
}

impl<S: Send> Gate for Mutex<Option<S>> {
    fn close(&self) {
        self.lock().take();
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }
}

/// Teardown handle of one running collection watch.
///
/// Dropping the handle tears the watch down.
pub struct WatchHandle {
    query: Query,
    cancel: CancellationToken,
    gate: Arc<dyn Gate>,
}

impl WatchHandle {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Stop the watch. Idempotent. No sink call happens after this returns.
    pub fn teardown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(query = %self.query, "watch teardown");
        }
        self.cancel.cancel();
        self.gate.close();
    }

    /// False once torn down, or after the watch terminated on its own.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.gate.is_open()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("query", &self.query)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Entry point for starting watches.
pub struct CollectionWatch;

impl CollectionWatch {
    /// Open the store watch for `E`'s collection filtered by `shape` and
    /// spawn its pump task.
    ///
    /// Fails when the store refuses or cannot establish the watch; the sink
    /// is never called in that case.
    pub async fn start<E, S>(
        store: &SharedStore,
        shape: QueryShape,
        sink: S,
    ) -> Result<WatchHandle, SubscriptionError>
    where
        E: Entity,
        S: EntitySink<E>,
    {
        let query = Query::new(E::KIND.collection(), shape);
        let channel = store.watch(query.clone()).await?;

        let gate = Arc::new(Mutex::new(Some(sink)));
        // Shared with the store side, so teardown stops the remote watch
        // synchronously rather than whenever the pump next wakes.
        let cancel = channel.token();

        let kind = E::KIND;
        let span = tracing::debug_span!("watch.transform", %kind, query = %query);
        tokio::spawn(pump::<E, S>(channel, Arc::clone(&gate), cancel.clone()).instrument(span));

        tracing::debug!(query = %query, "watch started");
        Ok(WatchHandle {
            query,
            cancel,
            gate,
        })
    }
}

/// Run `f` against the sink if the gate is still open. Returns false once
/// the gate is closed.
fn deliver<S>(gate: &Mutex<Option<S>>, f: impl FnOnce(&S)) -> bool {
    let guard = gate.lock();
    match guard.as_ref() {
        Some(sink) => {
            f(sink);
            true
        }
        None => false,
    }
}

fn terminate<E: Entity, S: EntitySink<E>>(gate: &Mutex<Option<S>>, error: SubscriptionError) {
    let sink = gate.lock().take();
    if let Some(sink) = sink {
        tracing::info!(error = %error, "watch terminated");
        sink.on_terminated(error);
    }
}

async fn pump<E, S>(mut channel: PushChannel, gate: Arc<Mutex<Option<S>>>, cancel: CancellationToken)
where
    E: Entity,
    S: EntitySink<E>,
{
    let mut generation = SyncGeneration::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = channel.recv() => event,
        };

        match event {
            Some(PushEvent::Snapshot(docs)) => {
                generation = generation.next();
                let items: Vec<Result<E, MalformedDocument>> =
                    docs.iter().map(E::from_document).collect();
                for malformed in items.iter().filter_map(|item| item.as_ref().err()) {
                    tracing::warn!(%malformed, "skipping malformed document");
                }
                tracing::trace!(generation = generation.0, documents = items.len(), "delivering push");
                if !deliver(&gate, |sink| sink.on_snapshot(items, generation)) {
                    break;
                }
            }
            Some(PushEvent::Interrupted { reason }) => {
                tracing::info!(%reason, "watch interrupted, waiting for resync");
            }
            Some(PushEvent::Rejected(err)) => {
                terminate::<E, S>(&gate, SubscriptionError::Rejected(err));
                break;
            }
            None => {
                terminate::<E, S>(
                    &gate,
                    SubscriptionError::Unavailable("push channel closed by store".into()),
                );
                break;
            }
        }
    }

    cancel.cancel();
    channel.unsubscribe();
}

// ============================================================================
// Tests
// ============================================================================
