//! Error taxonomy of the intercom runtime.
//!
//! None of these are fatal to the process: device errors halt capture or playback
//! locally, send failures are per-peer, session errors are routine disconnects, and
//! serialization errors cost a single message.

use crate::proto::{PeerIdentity, wire::WireError};

/// Errors reported by capture and output devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported by a [`PeerTransport`](crate::transport::PeerTransport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to send to {peer}: {reason}")]
    SendFailed { peer: PeerIdentity, reason: String },
    #[error("not connected to {0}")]
    NotConnected(PeerIdentity),
    #[error("transport session error: {0}")]
    Session(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    DeviceUnavailable(#[from] DeviceError),
    #[error(transparent)]
    TransportSendFailure(TransportError),
    #[error("transport session error: {0}")]
    TransportSessionError(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] WireError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn {what} thread: {reason}")]
    Spawn { what: &'static str, reason: String },
    #[error("the intercom has been shut down")]
    ShutDown,
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Session(reason) => Self::TransportSessionError(reason),
            e => Self::TransportSendFailure(e),
        }
    }
}

impl Error {
    /// Wraps a thread spawning failure.
    pub(crate) fn spawn(what: &'static str, e: std::io::Error) -> Self {
        Self::Spawn {
            what,
            reason: e.to_string(),
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
