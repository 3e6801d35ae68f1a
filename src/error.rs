//! Error types for idbclient
//!
//! Two layers of errors exist here:
//! - [`ErrorCode`] is the structured code carried by events and by protocol
//!   messages (it crosses the channel, so it is serializable).
//! - [`IdbError`] is returned synchronously from API calls when the caller
//!   misuses the API (inactive transaction, unknown store, ...).

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Structured error code surfaced to the embedder and exchanged with the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The transaction was aborted
    Abort,
    /// A constraint (unique index, existing key on add) was violated
    Constraint,
    /// Invalid key or key range
    Data,
    /// A value could not be decoded
    DataClone,
    /// Operation not allowed in the current state
    InvalidState,
    /// Unknown object store, index or database
    NotFound,
    /// Write operation in a read-only transaction
    ReadOnly,
    /// The transaction is not accepting operations
    TransactionInactive,
    /// Invalid argument
    Type,
    /// Storage quota exceeded
    QuotaExceeded,
    /// I/O failure while reading out-of-band data
    Io,
    /// Requested version is lower than the current one
    Version,
    /// Anything else, including protocol violations
    Unknown,
}

impl ErrorCode {
    /// DOM-style name of the error
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::Abort => "AbortError",
            ErrorCode::Constraint => "ConstraintError",
            ErrorCode::Data => "DataError",
            ErrorCode::DataClone => "DataCloneError",
            ErrorCode::InvalidState => "InvalidStateError",
            ErrorCode::NotFound => "NotFoundError",
            ErrorCode::ReadOnly => "ReadOnlyError",
            ErrorCode::TransactionInactive => "TransactionInactiveError",
            ErrorCode::Type => "TypeError",
            ErrorCode::QuotaExceeded => "QuotaExceededError",
            ErrorCode::Io => "IoError",
            ErrorCode::Version => "VersionError",
            ErrorCode::Unknown => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Unified error type for idbclient API calls
#[derive(Debug)]
pub enum IdbError {
    /// I/O error (blob sources, file handles)
    Io(io::Error),
    /// Transaction is not active (committing, done, aborted or out of scope)
    TransactionInactive(String),
    /// Write attempted in a read-only transaction
    ReadOnly(String),
    /// Object store, index, database or actor not found
    NotFound(String),
    /// Operation not allowed in the current state
    InvalidState(String),
    /// Invalid key or key range
    Data(String),
    /// Invalid argument
    Type(String),
    /// Constraint violation detected locally (duplicate store or index name)
    Constraint(String),
    /// Value encoding or decoding failed
    DataClone(String),
    /// Unexpected message shape or actor id from the remote side
    Protocol(String),
    /// The channel to the remote side is gone
    ChannelClosed(String),
    /// Generic internal error
    Internal(String),
}

impl IdbError {
    /// Create a "transaction not active" error for the given transaction serial number
    pub fn transaction_inactive(serial: u64) -> Self {
        IdbError::TransactionInactive(format!(
            "Transaction [{}] is not active",
            serial
        ))
    }

    /// Create an "object store not found" error
    pub fn object_store_not_found(name: &str) -> Self {
        IdbError::NotFound(format!("Object store '{}' not found", name))
    }

    /// Create an "index not found" error
    pub fn index_not_found(store: &str, index: &str) -> Self {
        IdbError::NotFound(format!("Index '{}' not found on object store '{}'", index, store))
    }

    /// Create an "unknown actor" error used when an id no longer maps to a live handle
    pub fn unknown_actor(kind: &str, id: u64) -> Self {
        IdbError::NotFound(format!("No live {} with id {}", kind, id))
    }

    /// Map this error to the structured code used in events and messages
    pub fn code(&self) -> ErrorCode {
        match self {
            IdbError::Io(_) => ErrorCode::Io,
            IdbError::TransactionInactive(_) => ErrorCode::TransactionInactive,
            IdbError::ReadOnly(_) => ErrorCode::ReadOnly,
            IdbError::NotFound(_) => ErrorCode::NotFound,
            IdbError::InvalidState(_) => ErrorCode::InvalidState,
            IdbError::Data(_) => ErrorCode::Data,
            IdbError::Type(_) => ErrorCode::Type,
            IdbError::Constraint(_) => ErrorCode::Constraint,
            IdbError::DataClone(_) => ErrorCode::DataClone,
            IdbError::Protocol(_) => ErrorCode::Unknown,
            IdbError::ChannelClosed(_) => ErrorCode::Abort,
            IdbError::Internal(_) => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for IdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdbError::Io(e) => write!(f, "{}", e),
            IdbError::TransactionInactive(msg) => write!(f, "{}", msg),
            IdbError::ReadOnly(msg) => write!(f, "{}", msg),
            IdbError::NotFound(msg) => write!(f, "{}", msg),
            IdbError::InvalidState(msg) => write!(f, "{}", msg),
            IdbError::Data(msg) => write!(f, "{}", msg),
            IdbError::Type(msg) => write!(f, "{}", msg),
            IdbError::Constraint(msg) => write!(f, "{}", msg),
            IdbError::DataClone(msg) => write!(f, "{}", msg),
            IdbError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            IdbError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
            IdbError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for IdbError {}

impl From<io::Error> for IdbError {
    fn from(e: io::Error) -> Self {
        IdbError::Io(e)
    }
}

impl From<serde_json::Error> for IdbError {
    fn from(e: serde_json::Error) -> Self {
        IdbError::DataClone(e.to_string())
    }
}

/// Result type alias for idbclient operations
pub type Result<T> = std::result::Result<T, IdbError>;
