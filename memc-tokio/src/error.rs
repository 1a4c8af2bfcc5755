use memc_core::protocol::ProtocolError;
use thiserror::Error;

/// An error surfaced by a client operation.
///
/// Variants carry rendered messages rather than source errors so that a
/// single failure can be cloned to every waiter of a batched request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The client was closed before or during the call.
    #[error("client is already closed")]
    ClientClosed,
    /// An argument was rejected before any I/O happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The per-operation or connection deadline fired.
    #[error("operation timed out")]
    Timeout,
    /// An I/O, TLS or authentication failure on a connection.
    #[error("connection failure: {0}")]
    Connection(String),
    /// The server answered `NOT_FOUND` to a command requiring the key
    /// to exist.
    #[error("key not found")]
    NotFound,
    /// A storage command answered `NOT_STORED` (or `EXISTS` for `cas`).
    #[error("item not stored")]
    NotStored,
    /// Any other non-`STORED` reply to a storage command.
    #[error("storage command failed: {0}")]
    Storage(String),
    /// A protocol-level failure: an error line, or a reply inconsistent
    /// with the issued command.
    #[error("command failed: {0}")]
    Command(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Command(err.to_string())
    }
}
