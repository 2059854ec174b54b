//! Materialized collection views.
//!
//! A [`CollectionView`] folds an interest's events into the current result
//! set. Entities of a push are staged and only become visible on its
//! `SnapshotComplete`, so readers never observe half a push.

use indexmap::IndexMap;

use worktable_types::{Board, DocumentId, Entity, Workspace};

use crate::error::SubscriptionError;
use crate::event::{SyncEvent, SyncGeneration};
use crate::registry::Interest;

/// Current entities of one subscription, in store order.
#[derive(Clone, Debug)]
pub struct CollectionView<E> {
    committed: IndexMap<DocumentId, E>,
    staging: IndexMap<DocumentId, E>,
    staged_malformed: usize,
    malformed: usize,
    generation: SyncGeneration,
    terminated: Option<SubscriptionError>,
}

impl<E> Default for CollectionView<E> {
    fn default() -> Self {
        Self {
            committed: IndexMap::new(),
            staging: IndexMap::new(),
            staged_malformed: 0,
            malformed: 0,
            generation: SyncGeneration::default(),
            terminated: None,
        }
    }
}

impl<E: Entity> CollectionView<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns true when the visible contents changed
    /// (a push completed) or the subscription terminated.
    pub fn apply(&mut self, event: SyncEvent<E>) -> bool {
        match event {
            SyncEvent::Entity(entity) => {
                self.staging.insert(entity.id().clone(), entity);
                false
            }
            SyncEvent::Malformed(_) => {
                self.staged_malformed += 1;
                false
            }
            SyncEvent::SnapshotComplete(generation) => {
                self.committed = std::mem::take(&mut self.staging);
                self.malformed = std::mem::take(&mut self.staged_malformed);
                self.generation = generation;
                true
            }
            SyncEvent::Terminated(err) => {
                self.staging.clear();
                self.staged_malformed = 0;
                self.terminated = Some(err);
                true
            }
        }
    }

    /// Drain every event already queued on `interest` without waiting.
    pub fn apply_pending(&mut self, interest: &mut Interest<E>) -> bool {
        let mut changed = false;
        while let Some(event) = interest.try_recv() {
            changed |= self.apply(event);
        }
        changed
    }

    /// Wait until the next push completes.
    pub async fn sync(&mut self, interest: &mut Interest<E>) -> Result<SyncGeneration, SubscriptionError> {
        loop {
            match interest.recv().await {
                Some(SyncEvent::SnapshotComplete(generation)) => {
                    self.apply(SyncEvent::SnapshotComplete(generation));
                    return Ok(generation);
                }
                Some(SyncEvent::Terminated(err)) => {
                    self.apply(SyncEvent::Terminated(err.clone()));
                    return Err(err);
                }
                Some(event) => {
                    self.apply(event);
                }
                None => return Err(SubscriptionError::Unavailable("interest released".into())),
            }
        }
    }

    pub fn get(&self, id: &DocumentId) -> Option<&E> {
        self.committed.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.committed.values()
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Malformed documents skipped in the last completed push.
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn generation(&self) -> SyncGeneration {
        self.generation
    }

    /// Whether at least one push has completed.
    pub fn is_ready(&self) -> bool {
        self.generation > SyncGeneration::default()
    }

    pub fn terminated(&self) -> Option<&SubscriptionError> {
        self.terminated.as_ref()
    }

    /// Owned copy of the visible entities.
    pub fn to_vec(&self) -> Vec<E> {
        self.committed.values().cloned().collect()
    }
}

impl CollectionView<Workspace> {
    /// Resolve a board's workspace relation. `None` when the workspace is not
    /// (or no longer) in view.
    pub fn workspace_of(&self, board: &Board) -> Option<&Workspace> {
        self.get(&board.workspace_id)
    }
}
