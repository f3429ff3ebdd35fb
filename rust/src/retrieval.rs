use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::backoff::exponential_backoff;
use crate::envelope::ReceivedEnvelope;
use crate::error::ObserverError;
use crate::jobs::FollowUpOperation;
use crate::observer::ObserverCore;
use crate::protocol_store::BufferedProtocolStore;
use crate::socket::{SocketError, WebSocketConnectionState};

pub(crate) const THREAD_NAME: &str = "MessageRetrievalService";

/// What the retrieval thread is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    /// Parked on the gate until a connection is needed.
    Idle,
    Connecting,
    Reading,
    Disconnecting,
    Terminated,
}

/// Body of the retrieval thread. Owns connect/read/disconnect; everything
/// else only releases the gate and lets this loop re-evaluate.
pub(crate) struct MessageRetrievalLoop {
    core: Arc<ObserverCore>,
}

impl MessageRetrievalLoop {
    pub(crate) fn new(core: Arc<ObserverCore>) -> Self {
        Self { core }
    }

    pub(crate) fn run(&self) -> Result<(), ObserverError> {
        let core = &self.core;
        let mut attempts: u32 = 0;
        tracing::info!("message retrieval started");

        while !core.is_terminated() {
            if attempts > 1 {
                let delay = exponential_backoff(attempts, core.config.backoff_cap);
                tracing::warn!(
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "too many failed connection attempts, backing off"
                );
                thread::sleep(delay);
                if core.is_terminated() {
                    break;
                }
            }

            core.set_retrieval_state(RetrievalState::Idle);
            let checks = core
                .gate
                .wait_until(|| core.is_terminated() || core.evaluator.is_connection_necessary());
            if core.is_terminated() {
                break;
            }
            tracing::info!(checks, "network access required, starting retrieval");

            core.set_retrieval_state(RetrievalState::Connecting);
            let state_rx = core.socket.subscribe_state();
            let result = self.read_while_necessary(&state_rx, &mut attempts);

            core.set_retrieval_state(RetrievalState::Disconnecting);
            core.socket.disconnect();
            self.observe_state_changes(&state_rx);
            if !core.app_visible() {
                core.platform.allow_process_death();
            }

            match result {
                Ok(()) => tracing::info!("connection no longer necessary, disconnected"),
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "message retrieval stopped");
                    core.mark_terminated();
                    core.set_retrieval_state(RetrievalState::Terminated);
                    return Err(err);
                }
                Err(err) => {
                    attempts = attempts.saturating_add(1);
                    tracing::warn!(error = %err, attempts, "message retrieval failed");
                }
            }
        }

        core.set_retrieval_state(RetrievalState::Terminated);
        tracing::info!("message retrieval terminated");
        Ok(())
    }

    fn read_while_necessary(
        &self,
        state_rx: &flume::Receiver<WebSocketConnectionState>,
        attempts: &mut u32,
    ) -> Result<(), ObserverError> {
        let core = &self.core;
        core.socket.connect()?;
        core.clear_local_disconnect();
        core.set_retrieval_state(RetrievalState::Reading);

        while !core.is_terminated() && core.evaluator.is_connection_necessary() {
            self.observe_state_changes(state_rx);

            let read_timeout = core.evaluator.timeouts().read_timeout;
            let started = Instant::now();
            let result = core.socket.read_batch(
                read_timeout,
                core.config.max_batch_size,
                &mut |batch: &[ReceivedEnvelope]| self.process_batch(batch),
            );
            // State changes seen during the read predate its queue-empty marker.
            self.observe_state_changes(state_rx);

            match result {
                Ok(has_more) => {
                    *attempts = 0;
                    tracing::debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        has_more,
                        "read message batch"
                    );
                    if !has_more {
                        core.drained.on_batch_exhausted();
                    }
                }
                Err(ObserverError::Socket(SocketError::Unavailable)) => {
                    tracing::info!("pipe unexpectedly unavailable, connecting");
                    core.socket.connect()?;
                    core.clear_local_disconnect();
                }
                Err(ObserverError::Socket(SocketError::Timeout)) => {
                    tracing::warn!("application level read timeout");
                    *attempts = 0;
                }
                Err(ObserverError::Socket(SocketError::Closed)) if core.take_local_disconnect() => {
                    tracing::info!("socket closed locally, re-evaluating connection");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Any state change on the socket means the server may hold envelopes we
    /// have not seen.
    fn observe_state_changes(&self, state_rx: &flume::Receiver<WebSocketConnectionState>) {
        let mut changed = false;
        for state in state_rx.try_iter() {
            tracing::debug!(?state, "websocket state changed");
            changed = true;
        }
        if changed {
            self.core.drained.on_reconnect();
        }
    }

    /// Each envelope commits in its own transaction. Follow-up jobs are
    /// enqueued only after commit, and the ack goes out last.
    fn process_batch(&self, batch: &[ReceivedEnvelope]) -> Result<(), ObserverError> {
        let core = &self.core;
        let started = Instant::now();
        let mut protocol_store = BufferedProtocolStore::new();
        let _locks = core.locks.acquire();

        for received in batch {
            let mut follow_ups = Vec::new();
            core.store.run_in_transaction(&mut |tx| {
                follow_ups = core
                    .dispatcher
                    .process_envelope(&mut protocol_store, tx, received)?;
                protocol_store.flush(tx)?;
                Ok(())
            })?;

            if !follow_ups.is_empty() {
                core.jobs.enqueue_all(
                    follow_ups
                        .into_iter()
                        .map(FollowUpOperation::into_job)
                        .collect(),
                );
            }
            core.socket.send_ack(received)?;
        }

        if !batch.is_empty() {
            let elapsed = started.elapsed();
            tracing::debug!(
                count = batch.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                per_envelope_ms = (elapsed / batch.len() as u32).as_millis() as u64,
                "decrypted batch"
            );
        }
        Ok(())
    }
}
