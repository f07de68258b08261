//! Crate-wide error taxonomy.
//!
//! Every public method returns [`Result<T>`]; recoverable local failures
//! (cache miss, freelist miss) are handled internally and never surface
//! as an `Error` variant here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // -- validation --
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("invalid key size: expected {expected}, got {got}")]
    InvalidKeysize { expected: u16, got: usize },

    #[error("bad key")]
    BadKey,

    #[error("bad scan spec: {0}")]
    BadScanSpec(&'static str),

    #[error("database already exists")]
    DatabaseAlreadyExists,

    #[error("database not found")]
    DatabaseNotFound,

    #[error("database already open")]
    DatabaseAlreadyOpen,

    #[error("name already in use")]
    NameAlreadyInUse,

    // -- storage --
    #[error("out of memory")]
    OutOfMemory,

    #[error("cache is full")]
    CacheFull,

    #[error("limits reached")]
    LimitsReached,

    #[error("blob not found: {blob_id}")]
    BlobNotFound { blob_id: u64 },

    #[error("key not found")]
    KeyNotFound,

    #[error("key was erased by the active transaction")]
    KeyErasedInTxn,

    // -- durability --
    #[error("invalid file header")]
    InvalidFileHeader,

    #[error("invalid file version")]
    InvalidFileVersion,

    #[error("invalid log file header")]
    LogInvalidFileHeader,

    #[error("database needs recovery")]
    NeedRecovery,

    #[error("file not found")]
    FileNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // -- concurrency --
    #[error("transaction conflict")]
    TxnConflict,

    #[error("cursor still open")]
    CursorStillOpen,

    #[error("cursor is nil")]
    CursorIsNil,

    // -- read protection --
    #[error("environment is write protected")]
    WriteProtected,
}
