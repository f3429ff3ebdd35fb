use std::sync::{Arc, Mutex, MutexGuard};

use crate::gate::ConnectionGate;
use crate::jobs::{JobQueue, ListenerControl};

pub type DrainListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrainListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTransition {
    NewlyDrained,
    AlreadyDrained,
}

#[derive(Default)]
struct DrainState {
    drained: bool,
    next_id: u64,
    listeners: Vec<(DrainListenerId, DrainListener)>,
}

/// Tracks whether every queued envelope has been read and decrypted, and
/// tells interested subsystems (e.g. number change waiting for the queue to
/// empty) when that happens.
///
/// The flag and the listener list share one lock so a listener added
/// concurrently with a drain transition runs exactly once.
pub struct DecryptionDrainedTracker {
    state: Mutex<DrainState>,
    gate: Arc<ConnectionGate>,
    jobs: Arc<dyn JobQueue>,
    decrypt_queue: String,
}

impl DecryptionDrainedTracker {
    pub fn new(gate: Arc<ConnectionGate>, jobs: Arc<dyn JobQueue>, decrypt_queue: String) -> Self {
        Self {
            state: Mutex::new(DrainState::default()),
            gate,
            jobs,
            decrypt_queue,
        }
    }

    fn state(&self) -> MutexGuard<'_, DrainState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.state().drained
    }

    /// Registers `listener`. If we are already drained it runs immediately,
    /// on the caller's thread.
    pub fn add_listener(&self, listener: DrainListener) -> DrainListenerId {
        let (id, already_drained) = {
            let mut state = self.state();
            let id = DrainListenerId(state.next_id);
            state.next_id += 1;
            state.listeners.push((id, listener.clone()));
            (id, state.drained)
        };
        if already_drained {
            listener();
        }
        id
    }

    pub fn remove_listener(&self, id: DrainListenerId) -> bool {
        let mut state = self.state();
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| *existing != id);
        state.listeners.len() != before
    }

    /// The server reported no more queued envelopes.
    pub fn on_batch_exhausted(&self) -> DrainTransition {
        let listeners: Vec<DrainListener> = {
            let mut state = self.state();
            if state.drained {
                drop(state);
                tracing::warn!("got tombstone, but we thought the network was already drained");
                return DrainTransition::AlreadyDrained;
            }
            state.drained = true;
            state.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        tracing::info!(listeners = listeners.len(), "decryptions newly drained");
        // Snapshot taken above: listeners may add/remove themselves while running.
        for listener in listeners {
            listener();
        }
        DrainTransition::NewlyDrained
    }

    /// Any connection state change means the server may have more for us.
    pub fn on_reconnect(&self) {
        self.state().drained = false;
    }

    /// Decrypt jobs finished elsewhere. Wake the retrieval loop once the
    /// decrypt queue is empty, now or when its last job completes.
    pub fn notify_drained_if_queue_empty(&self) {
        if self.jobs.is_queue_empty(&self.decrypt_queue) {
            tracing::info!("queue was empty when notified, signaling change");
            self.gate.release();
            return;
        }

        tracing::info!("queue still had items when notified, registering listener to signal change");
        let gate = self.gate.clone();
        let jobs = Arc::downgrade(&self.jobs);
        let queue = self.decrypt_queue.clone();
        self.jobs.add_queue_listener(
            &self.decrypt_queue,
            Box::new(move || {
                let Some(jobs) = jobs.upgrade() else {
                    return ListenerControl::Remove;
                };
                if jobs.is_queue_empty(&queue) {
                    tracing::info!("queue is now empty, signaling change");
                    gate.release();
                    ListenerControl::Remove
                } else {
                    tracing::info!("item finished in queue, but it's still not empty");
                    ListenerControl::Keep
                }
            }),
        );
    }
}
