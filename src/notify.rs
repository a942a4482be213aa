use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// In-process broadcast of engine events, one channel per entity (rule
/// or service). Subscribers that lag past the channel capacity lose the
/// oldest events, per broadcast semantics.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for an entity. Creates the channel if needed.
    pub fn subscribe(&self, entity_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(entity_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, entity_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&entity_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when the entity is deleted).
    #[allow(dead_code)]
    pub fn remove(&self, entity_id: &Ulid) {
        self.channels.remove(entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rule_id = Ulid::new();
        let mut rx = hub.subscribe(rule_id);

        let event = Event::SkipDateAdded {
            rule_id,
            date: NaiveDate::from_ymd_opt(2026, 8, 10).unwrap(),
            reason: None,
        };
        hub.send(rule_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rule_id = Ulid::new();
        // No subscriber — should not panic
        hub.send(rule_id, &Event::RuleDeleted { id: rule_id });
    }
}
