use crate::domain::transfer::{StatusEvent, TransferId, TransferStatus};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use tracing::debug;

/// Fans out status changes to subscribers, keyed by transfer id.
///
/// Each live transfer owns a `watch` channel holding its latest event, so a
/// subscriber always starts from the current state and can never miss the
/// terminal one. The channel is dropped once a terminal event is published;
/// later subscribers have to read the transfer store instead.
#[derive(Default)]
pub struct StatusNotifier {
    channels: DashMap<TransferId, watch::Sender<StatusEvent>>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the channel for a freshly created transfer.
    pub fn register(&self, initial: StatusEvent) {
        let (tx, _rx) = watch::channel(initial.clone());
        self.channels.insert(initial.transfer_id, tx);
    }

    /// Drops a channel without publishing, for transfers that were never stored.
    pub fn forget(&self, id: TransferId) {
        self.channels.remove(&id);
    }

    pub fn publish(&self, event: StatusEvent) {
        let id = event.transfer_id;
        let status = event.status;
        if status.is_terminal() {
            if let Some((_, tx)) = self.channels.remove(&id) {
                tx.send_replace(event);
            }
        } else if let Some(tx) = self.channels.get(&id) {
            tx.send_replace(event);
        }
        debug!(transfer_id = %id, status = %status, "Status published");
    }

    /// Stream of status events for `id`, or `None` when the transfer has no
    /// live channel (unknown, or already terminal).
    pub fn subscribe(&self, id: TransferId) -> Option<BoxStream<'static, StatusEvent>> {
        let rx = self.channels.get(&id)?.subscribe();
        Some(watch_stream(rx))
    }

    pub fn live_channels(&self) -> usize {
        self.channels.len()
    }
}

/// Emits each distinct status seen on `rx` and ends after a terminal one.
fn watch_stream(rx: watch::Receiver<StatusEvent>) -> BoxStream<'static, StatusEvent> {
    stream::unfold(Some((rx, None::<TransferStatus>)), |state| async move {
        let (mut rx, last) = state?;
        loop {
            let event = rx.borrow_and_update().clone();
            if last != Some(event.status) {
                let next = if event.status.is_terminal() {
                    None
                } else {
                    Some((rx, Some(event.status)))
                };
                return Some((event, next));
            }
            if rx.changed().await.is_err() {
                // Sender gone; whatever it left behind is final.
                let event = rx.borrow().clone();
                return (last != Some(event.status)).then_some((event, None));
            }
        }
    })
    .boxed()
}

/// A stream that yields exactly one event.
pub fn once(event: StatusEvent) -> BoxStream<'static, StatusEvent> {
    stream::iter([event]).boxed()
}
