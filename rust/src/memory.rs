//! In-process implementations of the observer's collaborators.
//!
//! Used by the crate's own tests and by hosts that want to drive the observer
//! without a real service connection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::dispatch::{DecryptResult, DecryptionFailure, Decryptor};
use crate::envelope::{Envelope, ReceivedEnvelope};
use crate::error::ObserverError;
use crate::jobs::{
    DecryptedMessage, ErrorMetadata, FollowUpOperation, Job, JobQueue, ListenerControl,
    QueueListener,
};
use crate::platform::{AccountState, NetworkMonitor, PlatformHooks};
use crate::protocol_store::{BufferedProtocolStore, ProtocolRecordKind};
use crate::socket::{BatchHandler, MessageSocket, SocketError, WebSocketConnectionState};
use crate::store::{StoreError, StoreTx};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

#[derive(Debug, Clone)]
enum Frame {
    Envelope(ReceivedEnvelope),
    QueueEmpty,
}

#[derive(Debug, Default)]
struct SocketState {
    connected: bool,
    /// Bumped on every connect/disconnect so a blocked read notices.
    session: u64,
    frames: VecDeque<Frame>,
    acks: Vec<ReceivedEnvelope>,
    connects: usize,
    disconnects: usize,
    fail_next_connects: u32,
    subscribers: Vec<flume::Sender<WebSocketConnectionState>>,
}

impl SocketState {
    fn publish(&mut self, state: WebSocketConnectionState) {
        self.subscribers.retain(|tx| tx.send(state).is_ok());
    }
}

/// A scripted message pipe. Envelopes pushed with [`InMemorySocket::push`]
/// are served in order; [`InMemorySocket::push_queue_empty`] marks where the
/// server would report that nothing else is queued.
#[derive(Debug, Default)]
pub struct InMemorySocket {
    state: Mutex<SocketState>,
    cond: Condvar,
}

impl InMemorySocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelopes: impl IntoIterator<Item = ReceivedEnvelope>) {
        let mut state = lock(&self.state);
        state
            .frames
            .extend(envelopes.into_iter().map(Frame::Envelope));
        self.cond.notify_all();
    }

    pub fn push_queue_empty(&self) {
        lock(&self.state).frames.push_back(Frame::QueueEmpty);
        self.cond.notify_all();
    }

    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.state).fail_next_connects = count;
    }

    /// Publishes an out-of-band connection state change to subscribers.
    pub fn emit_state(&self, state: WebSocketConnectionState) {
        lock(&self.state).publish(state);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn acks(&self) -> Vec<ReceivedEnvelope> {
        lock(&self.state).acks.clone()
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn pending_frames(&self) -> usize {
        lock(&self.state).frames.len()
    }

    /// Waits for frames, then takes up to `max_count` envelopes and the
    /// queue-empty marker if it directly follows them.
    fn take_batch(
        &self,
        timeout: Duration,
        max_count: usize,
    ) -> Result<(Vec<ReceivedEnvelope>, bool), SocketError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(SocketError::Unavailable);
        }
        let session = state.session;

        while state.frames.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(SocketError::Timeout);
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((g, _)) => g,
                Err(poison) => poison.into_inner().0,
            };
            if !state.connected || state.session != session {
                return Err(SocketError::Closed);
            }
        }

        let mut batch = Vec::new();
        let mut queue_empty = false;
        while batch.len() < max_count {
            match state.frames.front() {
                Some(Frame::Envelope(_)) => {
                    if let Some(Frame::Envelope(env)) = state.frames.pop_front() {
                        batch.push(env);
                    }
                }
                Some(Frame::QueueEmpty) => {
                    state.frames.pop_front();
                    queue_empty = true;
                    break;
                }
                None => break,
            }
        }
        Ok((batch, queue_empty))
    }
}

impl MessageSocket for InMemorySocket {
    fn connect(&self) -> Result<(), SocketError> {
        let mut state = lock(&self.state);
        state.publish(WebSocketConnectionState::Connecting);
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            state.publish(WebSocketConnectionState::Failed);
            return Err(SocketError::Other("scripted connect failure".into()));
        }
        if !state.connected {
            state.connected = true;
            state.session += 1;
            state.connects += 1;
        }
        state.publish(WebSocketConnectionState::Connected);
        self.cond.notify_all();
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = lock(&self.state);
        if state.connected {
            state.connected = false;
            state.session += 1;
            state.disconnects += 1;
            state.publish(WebSocketConnectionState::Disconnected);
        }
        self.cond.notify_all();
    }

    fn read_batch(
        &self,
        timeout: Duration,
        max_count: usize,
        handler: &mut BatchHandler<'_>,
    ) -> Result<bool, ObserverError> {
        let (batch, queue_empty) = self.take_batch(timeout, max_count)?;
        if !batch.is_empty() {
            handler(&batch)?;
        }
        Ok(!queue_empty)
    }

    fn send_ack(&self, envelope: &ReceivedEnvelope) -> Result<(), SocketError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(SocketError::Closed);
        }
        state.acks.push(envelope.clone());
        Ok(())
    }

    fn subscribe_state(&self) -> flume::Receiver<WebSocketConnectionState> {
        let (tx, rx) = flume::unbounded();
        lock(&self.state).subscribers.push(tx);
        rx
    }
}

#[derive(Default)]
struct JobQueueState {
    queues: HashMap<String, VecDeque<Job>>,
    listeners: HashMap<String, Vec<QueueListener>>,
    history: Vec<Job>,
}

/// Jobs sit in per-queue FIFOs until a test completes them with
/// [`InMemoryJobQueue::complete_next`].
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<JobQueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job ever enqueued, in order.
    pub fn enqueued(&self) -> Vec<Job> {
        lock(&self.state).history.clone()
    }

    pub fn pending(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Finishes the oldest job on `queue` and runs that queue's listeners.
    pub fn complete_next(&self, queue: &str) -> Option<Job> {
        let (job, listeners) = {
            let mut state = lock(&self.state);
            let job = state.queues.get_mut(queue).and_then(VecDeque::pop_front)?;
            let listeners = state.listeners.remove(queue).unwrap_or_default();
            (job, listeners)
        };

        // Listeners query the queue, so they run with the lock released.
        let kept: Vec<QueueListener> = listeners
            .into_iter()
            .filter_map(|mut listener| match listener() {
                ListenerControl::Keep => Some(listener),
                ListenerControl::Remove => None,
            })
            .collect();

        if !kept.is_empty() {
            let mut state = lock(&self.state);
            let slot = state.listeners.entry(queue.to_string()).or_default();
            let added_meanwhile = std::mem::replace(slot, kept);
            slot.extend(added_meanwhile);
        }
        Some(job)
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue_all(&self, jobs: Vec<Job>) {
        let mut state = lock(&self.state);
        for job in jobs {
            state.history.push(job.clone());
            state
                .queues
                .entry(job.queue.clone())
                .or_default()
                .push_back(job);
        }
    }

    fn is_queue_empty(&self, queue: &str) -> bool {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(true, VecDeque::is_empty)
    }

    fn add_queue_listener(&self, queue: &str, listener: QueueListener) {
        lock(&self.state)
            .listeners
            .entry(queue.to_string())
            .or_default()
            .push(listener);
    }
}

#[derive(Debug)]
pub struct StaticAccount {
    registered: AtomicBool,
    fcm_enabled: AtomicBool,
    websocket_forced: AtomicBool,
    proxy_enabled: AtomicBool,
}

impl StaticAccount {
    pub fn new(registered: bool, fcm_enabled: bool) -> Self {
        Self {
            registered: AtomicBool::new(registered),
            fcm_enabled: AtomicBool::new(fcm_enabled),
            websocket_forced: AtomicBool::new(false),
            proxy_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_registered(&self, value: bool) {
        self.registered.store(value, Ordering::SeqCst);
    }

    pub fn set_fcm_enabled(&self, value: bool) {
        self.fcm_enabled.store(value, Ordering::SeqCst);
    }

    pub fn set_websocket_forced(&self, value: bool) {
        self.websocket_forced.store(value, Ordering::SeqCst);
    }

    pub fn set_proxy_enabled(&self, value: bool) {
        self.proxy_enabled.store(value, Ordering::SeqCst);
    }
}

impl AccountState for StaticAccount {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn fcm_enabled(&self) -> bool {
        self.fcm_enabled.load(Ordering::SeqCst)
    }

    fn websocket_mode_forced(&self) -> bool {
        self.websocket_forced.load(Ordering::SeqCst)
    }

    fn proxy_enabled(&self) -> bool {
        self.proxy_enabled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct StaticNetwork {
    available: AtomicBool,
    censored: AtomicBool,
}

impl StaticNetwork {
    pub fn new(has_network: bool) -> Self {
        Self {
            available: AtomicBool::new(has_network),
            censored: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, value: bool) {
        self.available.store(value, Ordering::SeqCst);
    }

    pub fn set_censored(&self, value: bool) {
        self.censored.store(value, Ordering::SeqCst);
    }
}

impl NetworkMonitor for StaticNetwork {
    fn has_network(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn is_censored(&self) -> bool {
        self.censored.load(Ordering::SeqCst)
    }
}

/// Counts platform hook calls.
#[derive(Debug, Default)]
pub struct RecordingPlatformHooks {
    foreground_service_starts: AtomicUsize,
    keep_alive_calls: AtomicUsize,
    allow_death_calls: AtomicUsize,
    fail_foreground_service: AtomicBool,
}

impl RecordingPlatformHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_foreground_service(&self, fail: bool) {
        self.fail_foreground_service.store(fail, Ordering::SeqCst);
    }

    pub fn foreground_service_starts(&self) -> usize {
        self.foreground_service_starts.load(Ordering::SeqCst)
    }

    pub fn keep_alive_calls(&self) -> usize {
        self.keep_alive_calls.load(Ordering::SeqCst)
    }

    pub fn allow_death_calls(&self) -> usize {
        self.allow_death_calls.load(Ordering::SeqCst)
    }
}

impl PlatformHooks for RecordingPlatformHooks {
    fn start_foreground_service(&self) -> anyhow::Result<()> {
        self.foreground_service_starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_foreground_service.load(Ordering::SeqCst) {
            anyhow::bail!("foreground service not allowed from background");
        }
        Ok(())
    }

    fn keep_process_alive(&self) {
        self.keep_alive_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_process_death(&self) {
        self.allow_death_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Success { extra: Vec<FollowUpOperation> },
    Error(DecryptionFailure),
    Ignore,
    /// The decryptor hits a storage fault.
    StorageFault(String),
}

/// Plays back queued outcomes, one per envelope, then succeeds by default.
/// A success stores a session record for the sender so protocol writes can
/// be observed through the real store.
#[derive(Debug, Default)]
pub struct ScriptedDecryptor {
    outcomes: Mutex<VecDeque<DecryptOutcome>>,
    calls: AtomicU32,
}

impl ScriptedDecryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: DecryptOutcome) {
        lock(&self.outcomes).push_back(outcome);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decryptor for ScriptedDecryptor {
    fn decrypt(
        &self,
        store: &mut BufferedProtocolStore,
        tx: &mut dyn StoreTx,
        envelope: &Envelope,
        server_delivered_timestamp: u64,
    ) -> Result<DecryptResult, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = lock(&self.outcomes)
            .pop_front()
            .unwrap_or(DecryptOutcome::Success { extra: Vec::new() });
        let sender = envelope.source_service_id.clone().unwrap_or_default();

        match outcome {
            DecryptOutcome::Success { extra } => {
                let address = format!("{sender}.{}", envelope.source_device);
                let previous = store.load(tx, ProtocolRecordKind::Session, &address)?;
                let mut session = previous.unwrap_or_default();
                session.extend_from_slice(&envelope.timestamp.to_be_bytes());
                store.store(ProtocolRecordKind::Session, &address, session);

                Ok(DecryptResult::Success {
                    message: DecryptedMessage {
                        sender,
                        sender_device: envelope.source_device,
                        group_id: None,
                        timestamp: envelope.timestamp,
                        server_delivered_timestamp,
                        content: envelope.content.clone(),
                    },
                    follow_ups: extra,
                })
            }
            DecryptOutcome::Error(failure) => Ok(DecryptResult::Error {
                failure,
                metadata: ErrorMetadata {
                    sender,
                    sender_device: envelope.source_device,
                    group_id: None,
                },
                follow_ups: Vec::new(),
            }),
            DecryptOutcome::Ignore => Ok(DecryptResult::Ignore {
                follow_ups: Vec::new(),
            }),
            DecryptOutcome::StorageFault(reason) => Err(StoreError::Backend(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeType;
    use crate::jobs::JobKind;

    fn envelope(timestamp: u64) -> ReceivedEnvelope {
        ReceivedEnvelope {
            envelope: Envelope {
                envelope_type: EnvelopeType::Ciphertext,
                source_service_id: None,
                source_device: 1,
                timestamp,
                server_timestamp: timestamp,
                server_guid: None,
                content: Vec::new(),
            },
            server_delivered_timestamp: timestamp,
        }
    }

    fn read(socket: &InMemorySocket, max: usize) -> (Vec<u64>, Result<bool, ObserverError>) {
        let mut seen = Vec::new();
        let mut handler = |batch: &[ReceivedEnvelope]| {
            seen.extend(batch.iter().map(|e| e.envelope.timestamp));
            Ok::<(), ObserverError>(())
        };
        let result = socket.read_batch(Duration::from_millis(20), max, &mut handler);
        (seen, result)
    }

    #[test]
    fn socket_serves_batches_then_queue_empty() {
        let socket = InMemorySocket::new();
        socket.connect().unwrap();
        socket.push([envelope(1), envelope(2), envelope(3)]);
        socket.push_queue_empty();

        let (seen, more) = read(&socket, 2);
        assert_eq!(seen, vec![1, 2]);
        assert!(more.unwrap());

        let (seen, more) = read(&socket, 2);
        assert_eq!(seen, vec![3]);
        assert!(!more.unwrap());

        let (_, result) = read(&socket, 2);
        assert!(matches!(
            result,
            Err(ObserverError::Socket(SocketError::Timeout))
        ));
    }

    #[test]
    fn socket_requires_connection() {
        let socket = InMemorySocket::new();
        let (_, result) = read(&socket, 1);
        assert!(matches!(
            result,
            Err(ObserverError::Socket(SocketError::Unavailable))
        ));
        assert_eq!(socket.send_ack(&envelope(1)), Err(SocketError::Closed));
    }

    #[test]
    fn socket_publishes_state_changes() {
        let socket = InMemorySocket::new();
        let rx = socket.subscribe_state();
        socket.connect().unwrap();
        socket.disconnect();
        let states: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            states,
            vec![
                WebSocketConnectionState::Connecting,
                WebSocketConnectionState::Connected,
                WebSocketConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn job_queue_keeps_listeners_that_ask_to_stay() {
        let jobs = InMemoryJobQueue::new();
        jobs.enqueue_all(vec![Job::new("q", JobKind::RefreshPreKeys); 3]);
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        jobs.add_queue_listener(
            "q",
            Box::new(move || {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    ListenerControl::Keep
                } else {
                    ListenerControl::Remove
                }
            }),
        );

        for _ in 0..3 {
            jobs.complete_next("q");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(jobs.is_queue_empty("q"));
        assert_eq!(jobs.enqueued().len(), 3);
    }
}
