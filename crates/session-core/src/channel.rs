use tokio::sync::broadcast;

use crate::types::SessionEvent;

/// Broadcast event stream handed to subscribers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Fan-out bus for lifecycle events (`connected`, `disconnected`, `qr`, `message`).
#[derive(Clone, Debug)]
pub struct SessionEventBus {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionEventBus {
    /// Create a bus retaining up to `buffer` undelivered events per subscriber.
    pub fn new(buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted events. Only events emitted after this call are seen.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Receive the next event, skipping over lag notifications.
///
/// Returns `None` once the bus is dropped.
pub async fn recv_event(events: &mut EventStream) -> Option<SessionEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
