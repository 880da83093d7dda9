//! Authoritative protection state and its change listeners.

use defense_core::state::{ProtectionState, StateChangeEvent};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

pub type StateListener = Arc<dyn Fn(StateChangeEvent) + Send + Sync>;

/// Handle returned by `StateManager::on_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerToken(u64);

struct Inner {
    state: ProtectionState,
    // Keyed by a monotonically increasing token, so iteration order is
    // registration order.
    listeners: BTreeMap<ListenerToken, StateListener>,
    next_token: u64,
    // Events in swap order, waiting for fan-out.
    pending: VecDeque<StateChangeEvent>,
    // Set while some caller is draining `pending`.
    delivering: bool,
}

pub struct StateManager {
    inner: RwLock<Inner>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: ProtectionState::Starting,
                listeners: BTreeMap::new(),
                next_token: 0,
                pending: VecDeque::new(),
                delivering: false,
            }),
        }
    }

    pub fn current(&self) -> ProtectionState {
        self.inner.read().state
    }

    /// Moves to `next`. Returns the event when the value actually changed;
    /// repeating the current state is a no-op and notifies nobody.
    ///
    /// Listeners run without any lock held, one event at a time, in the
    /// order the swaps happened. When no other delivery is in progress they
    /// run on the calling thread before this returns. A transition made
    /// while a delivery is running (from another thread, or from inside a
    /// listener) is queued and handed out by that delivery once the current
    /// event has reached every listener.
    pub fn transition(&self, next: ProtectionState) -> Option<StateChangeEvent> {
        self.transition_if(next, |_| true)
    }

    /// Like `transition`, but only when `allow(current)` holds. The check and
    /// the swap happen under the same lock.
    pub fn transition_if<F>(&self, next: ProtectionState, allow: F) -> Option<StateChangeEvent>
    where
        F: FnOnce(ProtectionState) -> bool,
    {
        let (event, deliver) = {
            let mut inner = self.inner.write();
            if inner.state == next || !allow(inner.state) {
                return None;
            }
            let event = StateChangeEvent {
                old: inner.state,
                new: next,
            };
            inner.state = next;
            inner.pending.push_back(event);
            let deliver = !inner.delivering;
            inner.delivering = true;
            (event, deliver)
        };

        info!(from = %event.old, to = %event.new, "protection state changed");
        if deliver {
            self.deliver_pending();
        } else {
            debug!(from = %event.old, to = %event.new, "state change queued behind running delivery");
        }
        Some(event)
    }

    fn deliver_pending(&self) {
        loop {
            let (event, listeners) = {
                let mut inner = self.inner.write();
                let Some(event) = inner.pending.pop_front() else {
                    inner.delivering = false;
                    return;
                };
                let listeners: Vec<StateListener> = inner.listeners.values().cloned().collect();
                (event, listeners)
            };
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    error!(from = %event.old, to = %event.new, "state listener panicked");
                }
            }
        }
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(StateChangeEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        inner.next_token += 1;
        let token = ListenerToken(inner.next_token);
        inner.listeners.insert(token, Arc::new(listener));
        token
    }

    /// Returns false when the token was already removed.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.inner.write().listeners.remove(&token).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.read().listeners.len()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
