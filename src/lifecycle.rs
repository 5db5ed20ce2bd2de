use crate::error::Error;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// The connection's terminal latch: first writer wins, and the "closed" broadcast fires
/// exactly once. Every facade call consults this before and after its own work.
#[derive(Debug)]
pub(crate) struct Terminal {
    cause: OnceLock<Arc<Error>>,
    signal: CancellationToken,
}

impl Terminal {
    pub fn new() -> Self {
        Terminal {
            cause: OnceLock::new(),
            signal: CancellationToken::new(),
        }
    }

    /// Stores `cause` as the terminal error if none is latched yet, and fires the closed
    /// signal. Returns the cause that actually won the race, whether or not it was this one.
    pub fn latch(&self, cause: Error) -> Arc<Error> {
        let inner = match cause {
            Error::Closed(arc) => arc,
            other => Arc::new(other),
        };
        let won = self.cause.set(inner.clone()).is_ok();
        if won {
            self.signal.cancel();
        }
        self.cause.get().cloned().unwrap_or(inner)
    }

    /// The latched cause, wrapped as [`Error::Closed`], if the connection has terminated.
    pub fn cause(&self) -> Option<Error> {
        self.cause.get().cloned().map(Error::Closed)
    }

    pub fn is_latched(&self) -> bool {
        self.cause.get().is_some()
    }

    /// Resolves once the connection has reached its terminal state. Idempotent: callers that
    /// arrive after the fact resolve immediately, including every future call.
    pub async fn closed(&self) {
        self.signal.cancelled().await
    }
}
