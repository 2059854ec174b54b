//! Subscription registry: at most one live collection watch per
//! `(entity kind, query shape)`, shared by refcounted interests.
//!
//! # Lifecycle
//!
//! ```text
//! acquire ──(0→1)──▶ Subscription created ──start──▶ watch live
//!    │                     ▲                               │
//!    └──(n→n+1)────────────┘  joins, gets cached snapshot  │
//! release ──(n→n-1)── sink removed, channel drained        │
//!         ──(1→0)──── slot removed ───────────▶ watch torn down
//! ```
//!
//! # Locking
//!
//! `slots` is the only registry-wide lock. Acquire and release each mutate
//! it in one critical section; inside it they may take a subscription's
//! `state` or `fanout` lock. The watch's pump takes `gate → fanout`, and the
//! last release takes `slots → gate` to tear its watch down. Nothing takes
//! `slots` while holding any of those, and no lock is held across `.await`.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{OnceCell, mpsc};
use tracing::Instrument;

use worktable_store::SharedStore;
use worktable_types::{Entity, EntityKind, MalformedDocument, QueryShape};

use crate::error::SubscriptionError;
use crate::event::{SyncEvent, SyncGeneration};
use crate::watch::{CollectionWatch, EntitySink, WatchHandle};

// ============================================================================
// Keys
// ============================================================================

/// Identity of a subscription: which collection, filtered how.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub kind: EntityKind,
    pub shape: QueryShape,
}

impl SubscriptionKey {
    pub fn new(kind: EntityKind, shape: QueryShape) -> Self {
        Self { kind, shape }
    }

    pub fn of<E: Entity>(shape: QueryShape) -> Self {
        Self::new(E::KIND, shape)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.shape)
    }
}

// ============================================================================
// Fanout
// ============================================================================

type Items<E> = Vec<Result<E, MalformedDocument>>;

/// Pushes an interest may have queued before it is considered lagging.
pub const DEFAULT_INTEREST_BUFFER: usize = 16;

/// One complete push, shared by every interest it is queued on.
struct Push<E> {
    items: Items<E>,
    generation: SyncGeneration,
}

/// What travels on an interest's bounded channel.
enum Delivery<E> {
    Push(Arc<Push<E>>),
    Terminated(SubscriptionError),
}

struct SinkSlot<E> {
    tx: mpsc::Sender<Delivery<E>>,
    /// A push was skipped because the channel was full. The interest is
    /// handed the latest push once it has drained its queue.
    lagging: bool,
}

struct FanoutState<E> {
    sinks: HashMap<u64, SinkSlot<E>>,
    latest: Option<Arc<Push<E>>>,
    terminated: Option<SubscriptionError>,
}

/// The single sink of a subscription's watch, queueing each push on every
/// interest and caching the latest one for late joiners.
///
/// Interest channels are bounded. Every push is a full resync, so a push that
/// does not fit is skipped and the interest catches up from `latest` instead.
pub(crate) struct Fanout<E> {
    state: Mutex<FanoutState<E>>,
}

impl<E: Entity> Fanout<E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FanoutState {
                sinks: HashMap::new(),
                latest: None,
                terminated: None,
            }),
        }
    }

    /// Register an interest's sender, replaying the cached snapshot (or the
    /// terminal error) so it does not wait for the next change.
    fn add_sink(&self, id: u64, tx: mpsc::Sender<Delivery<E>>) {
        let mut state = self.state.lock();
        if let Some(err) = &state.terminated {
            let _ = tx.try_send(Delivery::Terminated(err.clone()));
            return;
        }
        if let Some(latest) = &state.latest {
            let _ = tx.try_send(Delivery::Push(Arc::clone(latest)));
        }
        state.sinks.insert(id, SinkSlot { tx, lagging: false });
    }

    fn remove_sink(&self, id: u64) {
        self.state.lock().sinks.remove(&id);
    }

    fn is_terminated(&self) -> bool {
        self.state.lock().terminated.is_some()
    }

    /// Called by an interest whose queue is empty. Returns what it missed
    /// while its channel was full: the latest push, or the terminal error.
    fn catch_up(&self, id: u64) -> Option<Delivery<E>> {
        let mut state = self.state.lock();
        if let Some(err) = state.terminated.clone() {
            // Still registered after termination means the error never fit.
            return state.sinks.remove(&id).map(|_| Delivery::Terminated(err));
        }
        let latest = state.latest.clone();
        let slot = state.sinks.get_mut(&id)?;
        if !slot.lagging {
            return None;
        }
        slot.lagging = false;
        tracing::debug!(interest = id, "lagging interest resynced from latest push");
        latest.map(Delivery::Push)
    }

    #[cfg(test)]
    fn sink_count(&self) -> usize {
        self.state.lock().sinks.len()
    }
}

impl<E: Entity> EntitySink<E> for Arc<Fanout<E>> {
    fn on_snapshot(&self, items: Items<E>, generation: SyncGeneration) {
        let push = Arc::new(Push { items, generation });
        let mut state = self.state.lock();
        state.sinks.retain(|id, slot| {
            match slot.tx.try_send(Delivery::Push(Arc::clone(&push))) {
                Ok(()) => {
                    slot.lagging = false;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    if !slot.lagging {
                        tracing::debug!(interest = *id, generation = generation.0, "interest lagging, push skipped");
                    }
                    slot.lagging = true;
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        state.latest = Some(push);
    }

    fn on_terminated(&self, error: SubscriptionError) {
        let mut state = self.state.lock();
        if state.terminated.is_some() {
            return;
        }
        // Sinks whose channel is full stay registered until they catch up.
        state.sinks.retain(|_, slot| {
            matches!(
                slot.tx.try_send(Delivery::Terminated(error.clone())),
                Err(TrySendError::Full(_))
            )
        });
        state.latest = None;
        state.terminated = Some(error);
    }
}

// ============================================================================
// Subscription
// ============================================================================

struct SubState {
    refcount: usize,
    watch: Option<WatchHandle>,
    /// Set once the subscription left the registry (refcount hit 0, or
    /// shutdown). A start that finishes afterwards tears its watch down.
    retired: bool,
}

struct Subscription<E: Entity> {
    key: SubscriptionKey,
    fanout: Arc<Fanout<E>>,
    state: Mutex<SubState>,
    ready: OnceCell<Result<(), SubscriptionError>>,
}

impl<E: Entity> Subscription<E> {
    fn new(key: SubscriptionKey) -> Self {
        Self {
            key,
            fanout: Arc::new(Fanout::new()),
            state: Mutex::new(SubState {
                refcount: 0,
                watch: None,
                retired: false,
            }),
            ready: OnceCell::new(),
        }
    }

    /// Open the remote watch. Runs at most once per subscription (unless the
    /// caller running it is cancelled, in which case the next waiter retries).
    async fn start(&self, store: SharedStore) -> Result<(), SubscriptionError> {
        let handle =
            CollectionWatch::start::<E, _>(&store, self.key.shape.clone(), Arc::clone(&self.fanout))
                .await?;

        let mut state = self.state.lock();
        if state.retired {
            drop(state);
            handle.teardown();
            tracing::debug!(key = %self.key, "subscription retired while starting");
            return Err(SubscriptionError::Shutdown);
        }
        state.watch = Some(handle);
        tracing::info!(key = %self.key, "subscription live");
        Ok(())
    }
}

/// Object-safe view of a `Subscription<E>` so one map holds every kind.
trait ErasedSubscription: Send + Sync {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Dead subscriptions are replaced on the next acquire.
    fn is_dead(&self) -> bool;

    fn refcount(&self) -> usize;

    fn has_live_watch(&self) -> bool;

    /// Retire, tear down, and terminate every interest with `Shutdown`.
    fn shutdown(&self);
}

impl<E: Entity> ErasedSubscription for Subscription<E> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn is_dead(&self) -> bool {
        self.fanout.is_terminated() || matches!(self.ready.get(), Some(Err(_)))
    }

    fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    fn has_live_watch(&self) -> bool {
        self.state
            .lock()
            .watch
            .as_ref()
            .is_some_and(WatchHandle::is_active)
    }

    fn shutdown(&self) {
        let watch = {
            let mut state = self.state.lock();
            state.retired = true;
            state.watch.take()
        };
        if let Some(watch) = watch {
            watch.teardown();
        }
        self.fanout.on_terminated(SubscriptionError::Shutdown);
    }
}

// ============================================================================
// Registry
// ============================================================================

type Slots = HashMap<SubscriptionKey, Arc<dyn ErasedSubscription>>;

struct RegistryInner {
    store: SharedStore,
    /// `None` after shutdown.
    slots: Mutex<Option<Slots>>,
    next_interest: AtomicU64,
    interest_buffer: usize,
}

/// Owner of all live subscriptions.
///
/// Created once at process start and passed to consumers; cloning shares
/// the same registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("live_watches", &self.live_watches())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self::with_interest_buffer(store, DEFAULT_INTEREST_BUFFER)
    }

    /// Registry whose interests queue at most `pushes` unread pushes each.
    pub fn with_interest_buffer(store: SharedStore, pushes: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                slots: Mutex::new(Some(HashMap::new())),
                next_interest: AtomicU64::new(1),
                interest_buffer: pushes.max(1),
            }),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    /// Register interest in `E` filtered by `shape`.
    ///
    /// Reuses the live subscription for the key if there is one (the new
    /// interest immediately receives its latest snapshot); otherwise starts
    /// a watch. Concurrent first acquires of a key share one start.
    pub async fn acquire<E: Entity>(
        &self,
        shape: QueryShape,
    ) -> Result<Interest<E>, SubscriptionError> {
        let key = SubscriptionKey::of::<E>(shape);
        let span = tracing::info_span!("registry.acquire", key = %key);
        self.acquire_inner::<E>(key).instrument(span).await
    }

    async fn acquire_inner<E: Entity>(
        &self,
        key: SubscriptionKey,
    ) -> Result<Interest<E>, SubscriptionError> {
        let id = self.inner.next_interest.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.interest_buffer);

        let sub: Arc<Subscription<E>> = {
            let mut guard = self.inner.slots.lock();
            let slots = guard.as_mut().ok_or(SubscriptionError::Shutdown)?;

            let existing = slots.get(&key).filter(|s| !s.is_dead()).cloned();
            let sub = match existing {
                Some(erased) => erased
                    .as_any()
                    .downcast::<Subscription<E>>()
                    .map_err(|_| SubscriptionError::KindMismatch {
                        key: key.to_string(),
                    })?,
                None => {
                    if slots.contains_key(&key) {
                        tracing::info!(key = %key, "replacing dead subscription");
                    }
                    let fresh = Arc::new(Subscription::<E>::new(key.clone()));
                    slots.insert(key.clone(), fresh.clone() as Arc<dyn ErasedSubscription>);
                    fresh
                }
            };

            let refcount = {
                let mut state = sub.state.lock();
                state.refcount += 1;
                state.refcount
            };
            sub.fanout.add_sink(id, tx);
            tracing::debug!(interest = id, refcount, "interest acquired");
            sub
        };

        let mut interest = Interest {
            id,
            rx,
            pending: VecDeque::new(),
            sub,
            registry: Arc::downgrade(&self.inner),
            released: false,
        };

        let store = Arc::clone(&self.inner.store);
        let ready = interest
            .sub
            .ready
            .get_or_init(|| interest.sub.start(store))
            .await
            .clone();

        match ready {
            Ok(()) => Ok(interest),
            Err(err) => {
                tracing::info!(error = %err, "acquire failed");
                interest.release();
                Err(err)
            }
        }
    }

    /// Release an interest. Same as [`Interest::release`].
    pub fn release<E: Entity>(&self, interest: &mut Interest<E>) {
        interest.release();
    }

    /// Number of subscriptions with a running watch.
    pub fn live_watches(&self) -> usize {
        self.inner
            .slots
            .lock()
            .as_ref()
            .map(|slots| slots.values().filter(|s| s.has_live_watch()).count())
            .unwrap_or(0)
    }

    /// Current refcount of a key, 0 if there is no subscription for it.
    pub fn refcount(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .slots
            .lock()
            .as_ref()
            .and_then(|slots| slots.get(key).map(|s| s.refcount()))
            .unwrap_or(0)
    }

    /// Tear down every watch, terminate every interest with
    /// [`SubscriptionError::Shutdown`] and refuse further acquires.
    /// Idempotent.
    pub fn shutdown(&self) {
        let Some(slots) = self.inner.slots.lock().take() else {
            return;
        };
        tracing::info!(subscriptions = slots.len(), "registry shutting down");
        for sub in slots.into_values() {
            sub.shutdown();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.slots.lock().is_none()
    }
}

// ============================================================================
// Interest
// ============================================================================

/// One consumer's revocable claim on a subscription.
///
/// Events arrive in order on a private bounded channel. A consumer that falls
/// more than the registry's interest buffer behind skips the pushes it missed
/// and resumes at the latest one. Releasing (explicitly or by drop) closes
/// and drains that channel, so nothing is observed afterwards.
pub struct Interest<E: Entity> {
    id: u64,
    rx: mpsc::Receiver<Delivery<E>>,
    /// The unread remainder of the push being handed out.
    pending: VecDeque<SyncEvent<E>>,
    sub: Arc<Subscription<E>>,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl<E: Entity> Interest<E> {
    pub fn key(&self) -> &SubscriptionKey {
        &self.sub.key
    }

    /// Next event, or `None` after release or termination.
    pub async fn recv(&mut self) -> Option<SyncEvent<E>> {
        loop {
            if let Some(event) = self.poll_ready() {
                return Some(event);
            }
            if self.released {
                return None;
            }
            let delivery = self.rx.recv().await?;
            self.unpack(delivery);
        }
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent<E>> {
        self.poll_ready()
    }

    /// Events already available without waiting, catching up on a skipped
    /// push once the channel has drained.
    fn poll_ready(&mut self) -> Option<SyncEvent<E>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.released {
                return None;
            }
            match self.rx.try_recv() {
                Ok(delivery) => self.unpack(delivery),
                Err(TryRecvError::Empty) => {
                    let delivery = self.sub.fanout.catch_up(self.id)?;
                    self.unpack(delivery);
                }
                Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn unpack(&mut self, delivery: Delivery<E>) {
        match delivery {
            Delivery::Push(push) => {
                self.pending.extend(push.items.iter().map(|item| match item {
                    Ok(entity) => SyncEvent::Entity(entity.clone()),
                    Err(malformed) => SyncEvent::Malformed(malformed.clone()),
                }));
                self.pending.push_back(SyncEvent::SnapshotComplete(push.generation));
            }
            Delivery::Terminated(err) => self.pending.push_back(SyncEvent::Terminated(err)),
        }
    }

    /// Pushes queued on the channel and not yet read.
    pub fn queued_pushes(&self) -> usize {
        self.rx.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Drop this interest's claim. Idempotent; a second call is a no-op and
    /// never affects other interests.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        self.pending.clear();
        self.sub.fanout.remove_sink(self.id);

        match self.registry.upgrade() {
            Some(registry) => {
                let mut guard = registry.slots.lock();
                let watch = {
                    let mut state = self.sub.state.lock();
                    state.refcount = state.refcount.saturating_sub(1);
                    tracing::debug!(key = %self.sub.key, interest = self.id, refcount = state.refcount, "interest released");
                    if state.refcount > 0 {
                        return;
                    }
                    state.retired = true;
                    state.watch.take()
                };
                if let Some(slots) = guard.as_mut() {
                    let ours = slots
                        .get(&self.sub.key)
                        .is_some_and(|s| std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(&self.sub)));
                    if ours {
                        slots.remove(&self.sub.key);
                    }
                }
                // Torn down before `slots` unlocks, so an acquire of the same
                // key never sees its new watch overlap this one.
                if let Some(watch) = watch {
                    tracing::info!(key = %self.sub.key, "last interest released, tearing down watch");
                    watch.teardown();
                }
                drop(guard);
            }
            // Registry gone: nobody else can hold this subscription's slot.
            None => {
                let watch = {
                    let mut state = self.sub.state.lock();
                    state.refcount = state.refcount.saturating_sub(1);
                    if state.refcount > 0 {
                        return;
                    }
                    state.retired = true;
                    state.watch.take()
                };
                if let Some(watch) = watch {
                    watch.teardown();
                }
            }
        }
    }

    /// Consume the interest as a stream of events. Releases on drop.
    pub fn into_stream(self) -> impl Stream<Item = SyncEvent<E>> + Send + 'static {
        futures::stream::unfold(self, |mut interest| async move {
            interest.recv().await.map(|event| (event, interest))
        })
    }
}

impl<E: Entity> Drop for Interest<E> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<E: Entity> fmt::Debug for Interest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interest")
            .field("id", &self.id)
            .field("key", &self.sub.key)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worktable_types::{Board, Workspace};

    #[test]
    fn test_key_display_and_equality() {
        let a = SubscriptionKey::of::<Board>(QueryShape::all().where_eq("workspaceId", "w1"));
        let b = SubscriptionKey::new(
            EntityKind::Board,
            QueryShape::all().where_eq("workspaceId", "w1"),
        );
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "board[workspaceId==w1]");
        assert_ne!(a, SubscriptionKey::of::<Workspace>(QueryShape::all()));
    }

    fn generation(delivery: Option<Delivery<Workspace>>) -> Option<u64> {
        match delivery {
            Some(Delivery::Push(push)) => Some(push.generation.0),
            _ => None,
        }
    }

    fn terminal(delivery: Option<Delivery<Workspace>>) -> Option<SubscriptionError> {
        match delivery {
            Some(Delivery::Terminated(err)) => Some(err),
            _ => None,
        }
    }

    #[test]
    fn test_fanout_replays_latest_to_late_sink() {
        let fanout = Arc::new(Fanout::<Workspace>::new());
        let (tx1, mut rx1) = mpsc::channel(4);
        fanout.add_sink(1, tx1);
        fanout.on_snapshot(vec![], SyncGeneration(3));
        assert_eq!(generation(rx1.try_recv().ok()), Some(3));

        let (tx2, mut rx2) = mpsc::channel(4);
        fanout.add_sink(2, tx2);
        assert_eq!(generation(rx2.try_recv().ok()), Some(3));
        assert_eq!(fanout.sink_count(), 2);
    }

    #[test]
    fn test_fanout_drops_closed_sinks() {
        let fanout = Arc::new(Fanout::<Workspace>::new());
        let (tx, rx) = mpsc::channel(4);
        fanout.add_sink(1, tx);
        drop(rx);
        fanout.on_snapshot(vec![], SyncGeneration(1));
        assert_eq!(fanout.sink_count(), 0);
    }

    #[test]
    fn test_fanout_termination_is_sticky() {
        let fanout = Arc::new(Fanout::<Workspace>::new());
        let (tx, mut rx) = mpsc::channel(4);
        fanout.add_sink(1, tx);
        fanout.on_terminated(SubscriptionError::Shutdown);
        fanout.on_terminated(SubscriptionError::Unavailable("again".into()));
        assert_eq!(terminal(rx.try_recv().ok()), Some(SubscriptionError::Shutdown));
        assert!(rx.try_recv().is_err());
        assert_eq!(fanout.sink_count(), 0);

        let (late, mut late_rx) = mpsc::channel(4);
        fanout.add_sink(2, late);
        assert_eq!(terminal(late_rx.try_recv().ok()), Some(SubscriptionError::Shutdown));
        assert!(fanout.is_terminated());
    }

    #[test]
    fn test_full_sink_skips_pushes_then_catches_up_on_latest() {
        let fanout = Arc::new(Fanout::<Workspace>::new());
        let (tx, mut rx) = mpsc::channel(2);
        fanout.add_sink(1, tx);
        for g in 1..=10 {
            fanout.on_snapshot(vec![], SyncGeneration(g));
        }
        // Nothing to catch up on while the queue still holds pushes.
        assert_eq!(generation(rx.try_recv().ok()), Some(1));
        assert_eq!(generation(rx.try_recv().ok()), Some(2));
        assert!(rx.try_recv().is_err());

        assert_eq!(generation(fanout.catch_up(1)), Some(10));
        assert!(fanout.catch_up(1).is_none());

        fanout.on_snapshot(vec![], SyncGeneration(11));
        assert_eq!(generation(rx.try_recv().ok()), Some(11));
    }

    #[test]
    fn test_full_sink_gets_termination_through_catch_up() {
        let fanout = Arc::new(Fanout::<Workspace>::new());
        let (tx, mut rx) = mpsc::channel(1);
        fanout.add_sink(1, tx);
        fanout.on_snapshot(vec![], SyncGeneration(1));
        fanout.on_terminated(SubscriptionError::Shutdown);
        assert_eq!(fanout.sink_count(), 1);

        assert_eq!(generation(rx.try_recv().ok()), Some(1));
        assert_eq!(terminal(fanout.catch_up(1)), Some(SubscriptionError::Shutdown));
        assert_eq!(fanout.sink_count(), 0);
        assert!(fanout.catch_up(1).is_none());
    }
}
