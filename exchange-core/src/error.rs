use thiserror::Error;

use crate::client::ClientError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The sink handle was closed or aborted and no longer accepts blocks.
    #[error("Sink handle is closed")]
    Closed,

    /// Another `close` is delivering the end of data block event.
    #[error("Sink handle is being closed")]
    Closing,

    /// `send` was called before the last blocking signal resolved.
    #[error("Sink handle is blocked")]
    Blocked,

    /// Memory accounting contract was violated (over-free, oversized reservation etc).
    #[error("Memory Error - {0}")]
    Memory(String),

    /// The block was already acknowledged or never existed.
    #[error("The data block doesn't exist. Sequence ID: {0}")]
    BlockNotFound(u64),

    /// A pending reservation was cancelled before it was granted.
    #[error("Memory reservation was cancelled")]
    ReservationCancelled,

    #[error("Delivery Error - {0}")]
    Delivery(String),

    #[error("Serde Error - {0}")]
    Serde(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Sink handle not found for fragment instance {0}")]
    HandleNotFound(String),

    #[error("Sink handle already exists for fragment instance {0}")]
    DuplicateHandle(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Error::Delivery(err.to_string())
    }
}
