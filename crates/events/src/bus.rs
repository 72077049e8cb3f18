use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::types::{Event, EventEnvelope};

const DEFAULT_CAPACITY: usize = 1000;

/// Broadcasts scheduler and research lifecycle events.
///
/// Research workers finish in any order, so every envelope carries a
/// sequence number assigned at publish time. Clones share the channel and
/// the sequence.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wraps and sends the event. With no subscriber the event is dropped,
    /// but it still consumes a sequence number.
    pub fn publish(&self, event: Event) -> EventEnvelope {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = EventEnvelope::new(sequence, event);
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    /// Events published before this call are not delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Sequence number of the last published event, 0 if none.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("last_sequence", &self.last_sequence())
            .finish()
    }
}

/// Collects everything currently buffered in the receiver without waiting.
/// Events lost to a lagging receiver are skipped; the gap shows in the
/// sequence numbers.
pub fn drain(receiver: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(envelope) => events.push(envelope),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn dispatched(title: &str) -> Event {
        Event::TaskDispatched {
            task_id: Uuid::new_v4(),
            milestone_id: Uuid::new_v4(),
            title: title.to_string(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_same_envelope() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let sent = bus.publish(dispatched("schema"));

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert_eq!(received1.id, sent.id);
        assert_eq!(received2.id, sent.id);
        assert_eq!(received1.sequence, 1);
    }

    #[test]
    fn test_sequence_counts_dropped_events() {
        let bus = EventBus::new();
        assert_eq!(bus.last_sequence(), 0);

        // No subscriber yet
        assert_eq!(bus.publish(Event::AllComplete).sequence, 1);

        let mut rx = bus.subscribe();
        bus.publish(dispatched("a"));
        bus.publish(dispatched("b"));

        let sequences: Vec<u64> = drain(&mut rx).iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(bus.last_sequence(), 3);
    }

    #[test]
    fn test_clones_share_sequence_and_channel() {
        let bus = EventBus::new();
        let research_bus = bus.clone();
        let mut rx = bus.subscribe();

        bus.publish(Event::ResearchPhaseChanged {
            from: "not_started".to_string(),
            to: "foundation".to_string(),
        });
        research_bus.publish(Event::TechnologiesCommitted {
            count: 3,
            skipped: 0,
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence, 2);
        assert_eq!(research_bus.subscriber_count(), 1);
    }

    #[test]
    fn test_drain_skips_lagged_events() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for title in ["a", "b", "c", "d"] {
            bus.publish(dispatched(title));
        }

        let sequences: Vec<u64> = drain(&mut rx).iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert!(drain(&mut rx).is_empty());
    }
}
