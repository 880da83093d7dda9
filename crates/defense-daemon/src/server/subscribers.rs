use defense_core::state::StateChangeEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

/// Events a subscriber may fall behind by before it is dropped.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Connections that asked for push events. Each one owns a bounded delivery
/// queue drained by its connection task, so publishing never touches a socket.
#[derive(Default)]
pub struct SubscriberSet {
    queues: Mutex<HashMap<Uuid, mpsc::Sender<StateChangeEvent>>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<StateChangeEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = Uuid::new_v4();
        self.queues.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.queues.lock().remove(&id).is_some()
    }

    /// Queues `event` for every subscriber. Subscribers whose connection has
    /// gone away, or whose queue is full, are dropped; dropping the sender
    /// lets their connection task drain what is queued and hang up. Returns
    /// how many were reached.
    pub fn publish(&self, event: StateChangeEvent) -> usize {
        let mut queues = self.queues.lock();
        queues.retain(|id, tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %id, "subscriber is not reading events, dropping it");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        queues.len()
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defense_core::state::ProtectionState;

    fn event(old: ProtectionState, new: ProtectionState) -> StateChangeEvent {
        StateChangeEvent { old, new }
    }

    #[test]
    fn every_subscriber_gets_events_in_order() {
        let set = SubscriberSet::new();
        let (_, mut a) = set.subscribe();
        let (_, mut b) = set.subscribe();

        let first = event(ProtectionState::Starting, ProtectionState::Protected);
        let second = event(ProtectionState::Protected, ProtectionState::Paused);
        assert_eq!(set.publish(first), 2);
        assert_eq!(set.publish(second), 2);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap(), first);
            assert_eq!(rx.try_recv().unwrap(), second);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let set = SubscriberSet::new();
        let (_, gone) = set.subscribe();
        let (_, mut kept) = set.subscribe();
        drop(gone);

        let ev = event(ProtectionState::Protected, ProtectionState::Alert);
        assert_eq!(set.publish(ev), 1);
        assert_eq!(set.len(), 1);
        assert_eq!(kept.try_recv().unwrap(), ev);
    }

    #[test]
    fn stalled_subscriber_is_dropped_when_its_queue_fills() {
        let set = SubscriberSet::new();
        let (_, mut stalled) = set.subscribe();
        let (_, mut reading) = set.subscribe();

        let ev = event(ProtectionState::Protected, ProtectionState::Scanning);
        for _ in 0..SUBSCRIBER_QUEUE_DEPTH {
            assert_eq!(set.publish(ev), 2);
            assert_eq!(reading.try_recv().unwrap(), ev);
        }
        assert_eq!(set.publish(ev), 1);
        assert_eq!(reading.try_recv().unwrap(), ev);

        // What was queued is still delivered, then the queue reports closed.
        for _ in 0..SUBSCRIBER_QUEUE_DEPTH {
            assert_eq!(stalled.try_recv().unwrap(), ev);
        }
        assert_eq!(
            stalled.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }

    #[test]
    fn unsubscribe_removes_once() {
        let set = SubscriberSet::new();
        let (id, _rx) = set.subscribe();
        assert!(set.unsubscribe(id));
        assert!(!set.unsubscribe(id));
        assert!(set.is_empty());
    }
}
