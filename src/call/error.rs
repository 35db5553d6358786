//! Call-related error types.

use crate::signaling::SessionCloseCode;
use thiserror::Error;

/// Errors surfaced by the call controller.
#[derive(Debug, Error)]
pub enum CallError {
    /// The operation is not valid for the current lifecycle state. Never
    /// retried, surfaced immediately.
    #[error("operation not allowed: {0}")]
    IllegalState(&'static str),

    /// The operation was superseded by a later `leave()` or a newer join
    /// generation. Surfaced only to the awaiting caller, never logged as a
    /// failure.
    #[error("operation superseded by leave or a newer join")]
    Cancelled,

    /// The join procedure failed on every attempt within the retry budget.
    #[error("join failed after {attempts} attempt(s): {source}")]
    JoinFailed {
        attempts: u32,
        #[source]
        source: SignalingError,
    },

    /// The server closed the session deliberately (e.g. ban). Not retried.
    #[error("session closed by server policy: {0:?}")]
    PolicyClosed(SessionCloseCode),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Transport and handshake errors from the signaling layer. Transient:
/// retried by the controller up to the retry budget.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to SFU: {0}")]
    Connect(String),

    #[error("timed out waiting for the SFU handshake")]
    HandshakeTimeout,

    #[error("call management request failed: {0}")]
    Rest(String),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("failed to send on signaling channel: {0}")]
    Send(String),
}
