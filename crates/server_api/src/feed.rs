use shared::protocol::ChangeEvent;
use tokio::sync::broadcast;
use tracing::debug;

const FEED_CAPACITY: usize = 1024;

/// Fan-out of committed changes to realtime subscribers.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_capacity(FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishing with no live subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        debug!(table = ?event.table, kind = ?event.kind, "publishing change");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}
