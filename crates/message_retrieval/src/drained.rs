use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{info, warn};

pub type DrainedListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrainedListenerId(u64);

#[derive(Default)]
struct DrainedInner {
    drained: bool,
    listeners: Arc<Vec<(DrainedListenerId, DrainedListener)>>,
}

/// Whether every message available since the last (re)connect has been read.
///
/// Listeners are stored copy-on-write so firing iterates a snapshot without
/// holding the lock; a listener may add or remove listeners while it runs.
#[derive(Default)]
pub struct DecryptionDrainedFlag {
    inner: Mutex<DrainedInner>,
    next_id: AtomicU64,
}

impl DecryptionDrainedFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`; it fires right away if the flag is already set.
    pub fn add_listener(&self, listener: DrainedListener) -> DrainedListenerId {
        let id = DrainedListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let already_drained = {
            let mut inner = self.inner.lock();
            let mut listeners = inner.listeners.as_ref().clone();
            listeners.push((id, Arc::clone(&listener)));
            inner.listeners = Arc::new(listeners);
            inner.drained
        };
        if already_drained {
            listener();
        }
        id
    }

    pub fn remove_listener(&self, id: DrainedListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        let listeners: Vec<_> = inner
            .listeners
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        let removed = listeners.len() != before;
        inner.listeners = Arc::new(listeners);
        removed
    }

    pub fn is_drained(&self) -> bool {
        self.inner.lock().drained
    }

    /// Sets the flag after a read reported an empty server queue.
    /// Returns true and fires every listener only on the false -> true edge.
    pub fn mark_drained(&self) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock();
            if inner.drained {
                None
            } else {
                inner.drained = true;
                Some(Arc::clone(&inner.listeners))
            }
        };
        let Some(listeners) = snapshot else {
            warn!("retrieval: got queue-empty marker while already drained");
            return false;
        };
        info!(listeners = listeners.len(), "retrieval: decryptions newly drained");
        for (_, listener) in listeners.iter() {
            listener();
        }
        true
    }

    pub fn reset(&self) {
        self.inner.lock().drained = false;
    }
}

#[cfg(test)]
#[path = "tests/drained_tests.rs"]
mod tests;
