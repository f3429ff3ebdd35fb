use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::clock::Clock;
use crate::config::ObserverConfig;
use crate::dispatch::{Decryptor, EnvelopeDispatcher};
use crate::drained::{DecryptionDrainedTracker, DrainListener, DrainListenerId};
use crate::error::ObserverError;
use crate::gate::ConnectionGate;
use crate::jobs::JobQueue;
use crate::locks::ProcessingLocks;
use crate::necessity::{lock_state, ConnectionState, NecessityEvaluator};
use crate::platform::{AccountState, NetworkMonitor, PlatformHooks};
use crate::retrieval::{MessageRetrievalLoop, RetrievalState, THREAD_NAME};
use crate::socket::MessageSocket;
use crate::store::MessageStore;

/// Everything the observer talks to, supplied by the host.
pub struct ObserverDeps {
    pub socket: Arc<dyn MessageSocket>,
    pub decryptor: Arc<dyn Decryptor>,
    pub jobs: Arc<dyn JobQueue>,
    pub store: Arc<dyn MessageStore>,
    pub account: Arc<dyn AccountState>,
    pub network: Arc<dyn NetworkMonitor>,
    pub platform: Arc<dyn PlatformHooks>,
    pub clock: Arc<dyn Clock>,
    /// Shared with any other code that mutates protocol state.
    pub locks: Arc<ProcessingLocks>,
}

/// State shared between the public handle and the retrieval thread.
pub(crate) struct ObserverCore {
    pub(crate) config: ObserverConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Arc<Mutex<ConnectionState>>,
    pub(crate) gate: Arc<ConnectionGate>,
    pub(crate) drained: Arc<DecryptionDrainedTracker>,
    pub(crate) evaluator: NecessityEvaluator,
    pub(crate) dispatcher: EnvelopeDispatcher,
    pub(crate) socket: Arc<dyn MessageSocket>,
    pub(crate) jobs: Arc<dyn JobQueue>,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) platform: Arc<dyn PlatformHooks>,
    pub(crate) locks: Arc<ProcessingLocks>,
    terminated: AtomicBool,
    /// Set when we close the socket ourselves, so the resulting read error
    /// does not count as a failed attempt.
    local_disconnect: AtomicBool,
    retrieval_state: RwLock<RetrievalState>,
}

impl ObserverCore {
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disconnect_locally(&self) {
        self.local_disconnect.store(true, Ordering::SeqCst);
        self.socket.disconnect();
    }

    pub(crate) fn take_local_disconnect(&self) -> bool {
        self.local_disconnect.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn clear_local_disconnect(&self) {
        self.local_disconnect.store(false, Ordering::SeqCst);
    }

    pub(crate) fn app_visible(&self) -> bool {
        lock_state(&self.state).app_visible
    }

    pub(crate) fn set_retrieval_state(&self, next: RetrievalState) {
        match self.retrieval_state.write() {
            Ok(mut slot) => *slot = next,
            Err(poison) => *poison.into_inner() = next,
        }
    }

    pub(crate) fn retrieval_state(&self) -> RetrievalState {
        match self.retrieval_state.read() {
            Ok(g) => *g,
            Err(poison) => *poison.into_inner(),
        }
    }
}

/// Keeps the authenticated message socket up exactly while it is needed and
/// turns every envelope it delivers into committed state plus follow-up jobs.
///
/// The host creates one per process. Dropping the handle terminates the
/// retrieval thread without waiting for it; use [`IncomingMessageObserver::join`]
/// to wait and collect a fatal error.
pub struct IncomingMessageObserver {
    core: Arc<ObserverCore>,
    handle: Option<JoinHandle<Result<(), ObserverError>>>,
}

impl IncomingMessageObserver {
    pub fn start(config: ObserverConfig, deps: ObserverDeps) -> Result<Self, ObserverError> {
        config
            .validate()
            .map_err(|e| ObserverError::Config(format!("{e:#}")))?;

        let ObserverDeps {
            socket,
            decryptor,
            jobs,
            store,
            account,
            network,
            platform,
            clock,
            locks,
        } = deps;

        let state = Arc::new(Mutex::new(ConnectionState::new(clock.now_millis())));
        let gate = Arc::new(ConnectionGate::new());
        let drained = Arc::new(DecryptionDrainedTracker::new(
            gate.clone(),
            jobs.clone(),
            config.decrypt_queue.clone(),
        ));
        let evaluator = NecessityEvaluator::new(
            state.clone(),
            clock.clone(),
            account.clone(),
            network,
            jobs.clone(),
            config.clone(),
        );

        if !account.fcm_enabled() || account.websocket_mode_forced() {
            tracing::info!(
                fcm = account.fcm_enabled(),
                force_websocket = account.websocket_mode_forced(),
                "starting foreground service for websocket delivery"
            );
            if let Err(err) = platform.start_foreground_service() {
                tracing::warn!(error = %format!("{err:#}"), "failed to start foreground service");
            }
        }

        let core = Arc::new(ObserverCore {
            config,
            dispatcher: EnvelopeDispatcher::new(decryptor, clock.clone()),
            clock,
            state,
            gate,
            drained,
            evaluator,
            socket,
            jobs,
            store,
            platform,
            locks,
            terminated: AtomicBool::new(false),
            local_disconnect: AtomicBool::new(false),
            retrieval_state: RwLock::new(RetrievalState::Idle),
        });

        let retrieval = MessageRetrievalLoop::new(core.clone());
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || retrieval.run())
            .map_err(ObserverError::Spawn)?;

        Ok(Self {
            core,
            handle: Some(handle),
        })
    }

    pub fn notify_registration_changed(&self) {
        self.core.gate.release();
    }

    pub fn add_decryption_drained_listener(&self, listener: DrainListener) -> DrainListenerId {
        self.core.drained.add_listener(listener)
    }

    pub fn remove_decryption_drained_listener(&self, id: DrainListenerId) -> bool {
        self.core.drained.remove_listener(id)
    }

    /// Decrypt-queue jobs have finished; reconnect once the queue is empty.
    pub fn notify_decryptions_drained(&self) {
        self.core.drained.notify_drained_if_queue_empty();
    }

    pub fn is_decryption_drained(&self) -> bool {
        self.core.drained.is_drained()
    }

    pub fn on_app_foregrounded(&self) {
        lock_state(&self.core.state).on_foreground();
        self.core.platform.keep_process_alive();
        self.core.gate.release();
    }

    pub fn on_app_backgrounded(&self) {
        let now = self.core.clock.now_millis();
        lock_state(&self.core.state).on_background(now);
        self.core.gate.release();
    }

    /// `available` is the new network state. Losing the network drops the
    /// socket right away instead of waiting for a read to time out.
    pub fn on_network_changed(&self, available: bool) {
        tracing::info!(available, "network changed");
        if !available {
            self.core.drained.on_reconnect();
            self.core.disconnect_locally();
        }
        self.core.gate.release();
    }

    pub fn register_keep_alive_token(&self, key: &str) {
        let now = self.core.clock.now_millis();
        lock_state(&self.core.state).register_lease(key, now);
        tracing::debug!(key, "registered keep-alive token");
        self.core.gate.release();
    }

    pub fn remove_keep_alive_token(&self, key: &str) {
        let now = self.core.clock.now_millis();
        lock_state(&self.core.state).remove_lease(key, now);
        tracing::debug!(key, "removed keep-alive token");
        self.core.gate.release();
    }

    pub fn is_connection_necessary(&self) -> bool {
        self.core.evaluator.is_connection_necessary()
    }

    pub fn retrieval_state(&self) -> RetrievalState {
        self.core.retrieval_state()
    }

    pub fn terminate(&self) {
        if self.core.is_terminated() {
            return;
        }
        tracing::info!("terminating incoming message observer");
        self.core.mark_terminated();
        self.core.disconnect_locally();
        self.core.gate.release();
    }

    /// Terminates and waits for the retrieval thread. Returns the error that
    /// stopped it, if it stopped on its own.
    pub fn join(mut self) -> Result<(), ObserverError> {
        self.terminate();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ObserverError::RetrievalPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for IncomingMessageObserver {
    fn drop(&mut self) {
        self.terminate();
    }
}
