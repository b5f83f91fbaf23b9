use thiserror::Error;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection checkout timed out after {0} ms")]
    CheckoutTimeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Invalid magic bytes - expected CRNB")]
    InvalidMagic,

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Blob in unexpected partition: expected {expected}, actual {actual}")]
    PartitionMismatch { expected: u64, actual: u64 },

    #[error("Store error: {0}")]
    Store(StoreErrorCode),

    #[error("Token decode failed: {0}")]
    TokenDecode(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CairnError>;

/// Error codes surfaced by a local blob store implementation.
///
/// `AlreadyExists` is special-cased by the replication writer: blob frames
/// are content-addressed, so a duplicate put is confirmation of progress,
/// not a failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    #[error("blob already exists")]
    AlreadyExists,
    #[error("blob not found")]
    NotFound,
    #[error("blob already deleted")]
    AlreadyDeleted,
    #[error("store I/O failure")]
    IoFailure,
    #[error("store unavailable")]
    Unavailable,
}
