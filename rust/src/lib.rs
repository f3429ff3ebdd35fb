//! Incoming message observer: keeps the authenticated message socket open
//! only while something needs it, and turns each delivered envelope into
//! committed state plus follow-up jobs.

mod backoff;
mod clock;
mod config;
mod dispatch;
mod drained;
mod envelope;
mod error;
mod gate;
mod jobs;
mod lease;
mod locks;
mod logging;
pub mod memory;
mod necessity;
mod observer;
mod platform;
mod protocol_store;
mod retrieval;
mod socket;
mod store;

pub use backoff::{capped_delay, exponential_backoff};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ObserverConfig, ObserverTimeouts, DECRYPT_QUEUE, DEFAULT_BACKOFF_CAP, DEFAULT_MAX_BATCH_SIZE,
};
pub use dispatch::{DecryptResult, DecryptionFailure, Decryptor, EnvelopeDispatcher};
pub use drained::{DecryptionDrainedTracker, DrainListener, DrainListenerId, DrainTransition};
pub use envelope::{classify, Envelope, EnvelopeClass, EnvelopeType, ReceivedEnvelope};
pub use error::ObserverError;
pub use gate::ConnectionGate;
pub use jobs::{
    process_queue, DecryptedMessage, ErrorMetadata, FollowUpOperation, Job, JobKind, JobQueue,
    ListenerControl, MessageState, QueueListener,
};
pub use lease::KeepAliveLeaseRegistry;
pub use locks::{ProcessingGuard, ProcessingLocks};
pub use logging::init_logging;
pub use necessity::{ConnectionInputs, ConnectionState, NecessityEvaluator};
pub use observer::{IncomingMessageObserver, ObserverDeps};
pub use platform::{AccountState, NetworkMonitor, NoopPlatformHooks, PlatformHooks};
pub use protocol_store::{BufferedProtocolStore, ProtocolRecordKind};
pub use retrieval::RetrievalState;
pub use socket::{BatchHandler, MessageSocket, SocketError, WebSocketConnectionState};
pub use store::{MessageStore, SqliteMessageStore, StoreError, StoreTx};
