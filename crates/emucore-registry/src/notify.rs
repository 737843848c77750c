use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

/// Published once per committed store mutation. Carries no payload; observers
/// re-read the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryChanged;

#[derive(Debug, Default)]
pub struct ChangeHub {
    subscribers: Mutex<Vec<(u64, Sender<RegistryChanged>)>>,
    next_id: AtomicU64,
}

impl ChangeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(self),
        }
    }

    pub fn publish(&self) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(id, tx)| {
            let alive = tx.send(RegistryChanged).is_ok();
            if !alive {
                log::debug!("dropping disconnected registry subscriber {id}");
            }
            alive
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(existing, _)| *existing != id);
    }
}

/// A live registration for change events. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: Receiver<RegistryChanged>,
    hub: Weak<ChangeHub>,
}

impl Subscription {
    pub fn receiver(&self) -> &Receiver<RegistryChanged> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Option<RegistryChanged> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RegistryChanged> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Consumes every queued event and returns how many there were.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
