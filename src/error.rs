use ethereum_types::H256;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Errors surfaced by the peer registry and the transport seam.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0:#x} already registered")]
    AlreadyRegistered(H256),
    #[error("peer {0:#x} not registered")]
    NotRegistered(H256),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Errors surfaced by the key-value store seam. All of them are fatal for
/// the running cycle.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Errors surfaced by the range-proof verifier and the account codec.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("range proof failed: {0}")]
    Verify(String),
    #[error("account decoding failed: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode sync progress: {0}")]
    Progress(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(&'static str),
    #[error("{0}")]
    Send(String),
}

impl SyncError {
    /// Whether a new sync cycle may be attempted after this error. Store and
    /// progress-encoding failures leave the database in an unknown state and
    /// abort the process-level retry loop.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Store(_) | SyncError::Progress(_) => false,
            SyncError::Cancelled
            | SyncError::Peer(_)
            | SyncError::Proof(_)
            | SyncError::UnexpectedPayload(_)
            | SyncError::Send(_) => true,
        }
    }
}

impl<T> From<SendError<T>> for SyncError {
    fn from(value: SendError<T>) -> Self {
        Self::Send(value.to_string())
    }
}
