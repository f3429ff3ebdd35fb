use crate::socket::SocketError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("socket: {0}")]
    Socket(#[from] SocketError),
    /// Persistence faults are not recoverable by the retrieval loop.
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("config: {0}")]
    Config(String),
    #[error("failed to spawn message retrieval thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("message retrieval thread panicked")]
    RetrievalPanicked,
}

impl ObserverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
