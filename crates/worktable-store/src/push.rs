//! Push channels: the delivery path of one store watch.
//!
//! The store side holds a [`PushSender`], the watcher holds a
//! [`PushChannel`]. Unsubscribing (or dropping the channel) cancels the
//! sender and discards anything still buffered, so once
//! [`PushChannel::unsubscribe`] returns no further event is observed.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use worktable_types::RawDocument;

use crate::error::StoreError;

/// One event pushed by a store watch.
#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    /// The complete current result set of the query, in store order.
    Snapshot(Vec<RawDocument>),
    /// Transport blip. Not terminal; a fresh snapshot follows once the
    /// watch is back.
    Interrupted { reason: String },
    /// The store refused the query. Terminal: nothing follows.
    Rejected(StoreError),
}

impl PushEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PushEvent::Rejected(_))
    }
}

/// Create a linked sender/channel pair with `buffer` slots.
pub fn push_channel(buffer: usize) -> (PushSender, PushChannel) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let cancel = CancellationToken::new();
    (
        PushSender {
            tx,
            cancel: cancel.clone(),
        },
        PushChannel { rx, cancel },
    )
}

/// Store-side end of a push channel.
#[derive(Debug)]
pub struct PushSender {
    tx: mpsc::Sender<PushEvent>,
    cancel: CancellationToken,
}

impl PushSender {
    /// Send an event, waiting for buffer space.
    ///
    /// Returns false once the watcher has unsubscribed; the caller should
    /// stop producing.
    pub async fn send(&self, event: PushEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Resolves when the watcher unsubscribes.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Token shared with the channel, for bookkeeping of live watches.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Watcher-side end of a push channel.
#[derive(Debug)]
pub struct PushChannel {
    rx: mpsc::Receiver<PushEvent>,
    cancel: CancellationToken,
}

impl PushChannel {
    /// Next pushed event. `None` once the store side is gone or after
    /// [`unsubscribe`](Self::unsubscribe).
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    /// Stop the watch. Idempotent. No event is observed afterwards.
    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that stops the watch when cancelled, usable from outside the
    /// task that owns the channel. Buffered events are dropped once the
    /// owner calls [`unsubscribe`](Self::unsubscribe).
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
