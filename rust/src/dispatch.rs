use std::sync::Arc;

use crate::clock::Clock;
use crate::envelope::{classify, Envelope, EnvelopeClass, ReceivedEnvelope};
use crate::jobs::{DecryptedMessage, ErrorMetadata, FollowUpOperation, MessageState};
use crate::protocol_store::BufferedProtocolStore;
use crate::store::{StoreError, StoreTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionFailure {
    LegacyMessage,
    InvalidVersion,
    UnsupportedDataMessage,
    DecryptionError,
}

impl DecryptionFailure {
    pub fn message_state(self) -> MessageState {
        match self {
            Self::LegacyMessage => MessageState::LegacyMessage,
            Self::InvalidVersion => MessageState::InvalidVersion,
            Self::UnsupportedDataMessage => MessageState::UnsupportedDataMessage,
            Self::DecryptionError => MessageState::DecryptionError,
        }
    }
}

/// Outcome of decrypting one envelope. A failed decrypt is a value here, not
/// an error: it becomes a recorded error entry via a follow-up job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptResult {
    Success {
        message: DecryptedMessage,
        follow_ups: Vec<FollowUpOperation>,
    },
    Error {
        failure: DecryptionFailure,
        metadata: ErrorMetadata,
        follow_ups: Vec<FollowUpOperation>,
    },
    Ignore {
        follow_ups: Vec<FollowUpOperation>,
    },
}

pub trait Decryptor: Send + Sync {
    /// Decrypts `envelope`, reading and mutating protocol state through
    /// `store`. Only storage faults are returned as `Err`.
    fn decrypt(
        &self,
        store: &mut BufferedProtocolStore,
        tx: &mut dyn StoreTx,
        envelope: &Envelope,
        server_delivered_timestamp: u64,
    ) -> Result<DecryptResult, StoreError>;
}

pub struct EnvelopeDispatcher {
    decryptor: Arc<dyn Decryptor>,
    clock: Arc<dyn Clock>,
}

impl EnvelopeDispatcher {
    pub fn new(decryptor: Arc<dyn Decryptor>, clock: Arc<dyn Clock>) -> Self {
        Self { decryptor, clock }
    }

    /// Handles one envelope inside the caller's transaction. Receipts are
    /// written directly; messages only produce follow-up work, which the
    /// caller runs after commit.
    pub fn process_envelope(
        &self,
        store: &mut BufferedProtocolStore,
        tx: &mut dyn StoreTx,
        received: &ReceivedEnvelope,
    ) -> Result<Vec<FollowUpOperation>, StoreError> {
        let envelope = &received.envelope;
        match classify(envelope) {
            EnvelopeClass::Receipt => {
                self.process_receipt(tx, envelope)?;
                Ok(Vec::new())
            }
            EnvelopeClass::Message => {
                self.process_message(store, tx, envelope, received.server_delivered_timestamp)
            }
            EnvelopeClass::Unknown => {
                tracing::warn!(
                    envelope_type = envelope.envelope_type.wire_value(),
                    "received envelope of unknown type"
                );
                Ok(Vec::new())
            }
        }
    }

    fn process_message(
        &self,
        store: &mut BufferedProtocolStore,
        tx: &mut dyn StoreTx,
        envelope: &Envelope,
        server_delivered_timestamp: u64,
    ) -> Result<Vec<FollowUpOperation>, StoreError> {
        let result = self
            .decryptor
            .decrypt(store, tx, envelope, server_delivered_timestamp)?;
        let follow_ups = match result {
            DecryptResult::Success {
                message,
                mut follow_ups,
            } => {
                follow_ups.push(FollowUpOperation::ProcessMessage(message));
                follow_ups
            }
            DecryptResult::Error {
                failure,
                metadata,
                mut follow_ups,
            } => {
                tracing::warn!(
                    ?failure,
                    sender = %metadata.sender,
                    device = metadata.sender_device,
                    timestamp = envelope.timestamp,
                    "decryption failed"
                );
                follow_ups.push(FollowUpOperation::RecordError {
                    state: failure.message_state(),
                    metadata,
                    timestamp: envelope.timestamp,
                });
                follow_ups
            }
            DecryptResult::Ignore { follow_ups } => follow_ups,
        };
        Ok(follow_ups)
    }

    fn process_receipt(&self, tx: &mut dyn StoreTx, envelope: &Envelope) -> Result<(), StoreError> {
        let sender = match envelope
            .source_service_id
            .as_deref()
            .map(uuid::Uuid::parse_str)
        {
            Some(Ok(uuid)) => uuid.to_string(),
            _ => {
                tracing::warn!("invalid envelope source uuid");
                return Ok(());
            }
        };

        tracing::info!(
            sender = %sender,
            device = envelope.source_device,
            timestamp = envelope.timestamp,
            "received server receipt"
        );
        let found =
            tx.increment_delivery_receipt_count(envelope.timestamp, &sender, self.clock.now_millis())?;
        if !found {
            tracing::debug!(timestamp = envelope.timestamp, "receipt for unknown message");
        }
        tx.delete_send_log_entry(envelope.timestamp, &sender, envelope.source_device)?;
        Ok(())
    }
}
