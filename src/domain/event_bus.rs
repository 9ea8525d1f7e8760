//! Fan-out of session events to any number of observers.
//!
//! Each observer owns an unbounded channel, so publishing never blocks the
//! session and every observer sees events in publish order.

use crate::domain::models::SessionEvent;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It receives every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live observer; dropped observers are pruned
    pub(crate) fn publish(&self, event: SessionEvent) {
        trace!("Publishing {:?}", event);
        self.lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<SessionEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DisconnectReason;

    fn disconnected() -> SessionEvent {
        SessionEvent::Disconnected {
            reason: DisconnectReason::Requested,
        }
    }

    #[test]
    fn test_every_subscriber_sees_events_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(SessionEvent::ServicesDiscovered(Default::default()));
        bus.publish(disconnected());

        for rx in [&mut a, &mut b] {
            assert!(matches!(
                rx.try_recv(),
                Ok(SessionEvent::ServicesDiscovered(_))
            ));
            assert_eq!(rx.try_recv(), Ok(disconnected()));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(disconnected());
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }
}
