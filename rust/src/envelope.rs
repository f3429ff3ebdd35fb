use serde::{Deserialize, Serialize};

/// Envelope types as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
    UnidentifiedSender,
    PlaintextContent,
    Unknown(i32),
}

impl EnvelopeType {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => Self::Ciphertext,
            2 => Self::KeyExchange,
            3 => Self::PrekeyBundle,
            5 => Self::Receipt,
            6 => Self::UnidentifiedSender,
            8 => Self::PlaintextContent,
            other => Self::Unknown(other),
        }
    }

    pub fn wire_value(self) -> i32 {
        match self {
            Self::Ciphertext => 1,
            Self::KeyExchange => 2,
            Self::PrekeyBundle => 3,
            Self::Receipt => 5,
            Self::UnidentifiedSender => 6,
            Self::PlaintextContent => 8,
            Self::Unknown(v) => v,
        }
    }
}

/// One inbound ciphertext unit. Consumed exactly once: decrypted, then acked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    /// Service id (UUID string) of the sender, absent for sealed sender.
    pub source_service_id: Option<String>,
    pub source_device: u32,
    /// Sender-assigned timestamp, also the key receipts refer back to.
    pub timestamp: u64,
    pub server_timestamp: u64,
    pub server_guid: Option<String>,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEnvelope {
    pub envelope: Envelope,
    pub server_delivered_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeClass {
    Receipt,
    Message,
    Unknown,
}

pub fn classify(envelope: &Envelope) -> EnvelopeClass {
    match envelope.envelope_type {
        EnvelopeType::Receipt => EnvelopeClass::Receipt,
        EnvelopeType::PrekeyBundle
        | EnvelopeType::Ciphertext
        | EnvelopeType::UnidentifiedSender
        | EnvelopeType::PlaintextContent => EnvelopeClass::Message,
        EnvelopeType::KeyExchange | EnvelopeType::Unknown(_) => EnvelopeClass::Unknown,
    }
}
