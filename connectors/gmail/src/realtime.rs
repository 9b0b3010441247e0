use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::RealtimeEvent;

const CHANNEL_CAPACITY: usize = 64;

/// Per-user fan-out to live connections. Nothing is queued for users with no
/// open connection.
#[derive(Clone, Default)]
pub struct RealtimeNotifier {
    channels: Arc<DashMap<String, broadcast::Sender<RealtimeEvent>>>,
}

impl RealtimeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<RealtimeEvent> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns how many live connections received the event.
    pub fn notify(&self, user_id: &str, event: RealtimeEvent) -> usize {
        let event_name = event.name();
        let delivered = match self.channels.get(user_id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };

        if delivered == 0 {
            self.channels
                .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
            debug!("No live connections for user {}; dropped {}", user_id, event_name);
        } else {
            debug!("Delivered {} to {} connection(s) of user {}", event_name, delivered, user_id);
        }

        delivered
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.channels
            .get(user_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}
