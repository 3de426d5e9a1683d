//! Publish/subscribe fan-out of backend notifications
//!
//! Each control session registers a bounded queue. Publishing never blocks:
//! a session whose queue is full is dropped, which closes its receiver and
//! ends the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::event::Notify;

/// Identifier of a subscribed session
pub type SessionId = u64;

/// A session's end of the bus
#[derive(Debug)]
pub struct Subscription {
    pub id: SessionId,
    pub rx: mpsc::Receiver<Arc<Notify>>,
}

/// Session registry and broadcaster
#[derive(Debug)]
pub struct NotifyBus {
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<Arc<Notify>>>>,
    queue: usize,
    next_id: AtomicU64,
}

impl NotifyBus {
    /// Create a bus whose sessions hold at most `queue` pending messages
    pub fn new(queue: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            queue: queue.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        log::debug!("Session {} subscribed", id);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SessionId) {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            log::debug!("Session {} unsubscribed", id);
        }
    }

    /// Number of subscribed sessions
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `notify` to every session
    pub fn publish(&self, notify: Notify) {
        let notify = Arc::new(notify);
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|id, tx| deliver(*id, tx, notify.clone()));
    }

    /// Deliver `notify` to one session only; false if the session is gone
    pub fn send_to(&self, id: SessionId, notify: Notify) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sessions.get(&id) else {
            return false;
        };
        if deliver(id, tx, Arc::new(notify)) {
            true
        } else {
            sessions.remove(&id);
            false
        }
    }
}

fn deliver(id: SessionId, tx: &mpsc::Sender<Arc<Notify>>, notify: Arc<Notify>) -> bool {
    match tx.try_send(notify) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::warn!("Session {} is not keeping up, disconnecting it", id);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::State;

    fn state(s: State) -> Notify {
        Notify {
            state: Some(s),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_sessions_in_order() {
        let bus = NotifyBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_ne!(a.id, b.id);

        bus.publish(state(State::Starting));
        bus.publish(state(State::Running));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.rx.recv().await.unwrap().state, Some(State::Starting));
            assert_eq!(sub.rx.recv().await.unwrap().state, Some(State::Running));
        }
    }

    #[tokio::test]
    async fn test_full_session_is_dropped() {
        let bus = NotifyBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for _ in 0..2 {
            bus.publish(state(State::Running));
            fast.rx.recv().await.unwrap();
        }
        assert_eq!(bus.len(), 2);

        // Third message overflows the slow session only
        bus.publish(state(State::Stopped));
        assert_eq!(bus.len(), 1);
        assert_eq!(fast.rx.recv().await.unwrap().state, Some(State::Stopped));

        // The slow session drains what it had, then sees the channel close
        assert!(slow.rx.recv().await.is_some());
        assert!(slow.rx.recv().await.is_some());
        assert!(slow.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_and_unsubscribe() {
        let bus = NotifyBus::new(4);
        let mut a = bus.subscribe();
        let b = bus.subscribe();

        assert!(bus.send_to(a.id, Notify::error("only for a")));
        assert_eq!(a.rx.recv().await.unwrap().error.as_deref(), Some("only for a"));

        bus.unsubscribe(b.id);
        assert!(!bus.send_to(b.id, Notify::error("gone")));
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_pruned() {
        let bus = NotifyBus::new(4);
        let a = bus.subscribe();
        drop(a);
        bus.publish(state(State::Running));
        assert!(bus.is_empty());
    }
}
