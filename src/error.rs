use crate::close::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

/// Error taxonomy for the connection engine.
///
/// [`Error::Closed`] is the terminal-latch wrapper: once a connection reaches its terminal
/// state, every facade call returns a fresh `Closed` wrapping the same `Arc<Error>`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("caller misuse: {0}")]
    CallerMisuse(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The connection's terminal close code and reason, whichever side initiated it: a peer
    /// close frame surfaces here exactly like a local [`crate::connection::Conn::close`] call.
    #[error("connection closed: code={code:?} reason={reason:?}")]
    Close { code: StatusCode, reason: String },

    #[error("{0}")]
    Timeout(String),

    #[error("internal channel communication error")]
    CommunicationError,

    #[error("connection broken: {0}")]
    Closed(Arc<Error>),
}

impl From<RecvError> for Error {
    fn from(_: RecvError) -> Self {
        Error::CommunicationError
    }
}

impl Error {
    /// True if this error already carries the terminal "connection broken" wrapper.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }
}
