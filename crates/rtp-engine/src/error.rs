use std::io;

use thiserror::Error;

/// Errors returned by fallible engine operations.
///
/// Packets that fail admission are not errors; they are reported as
/// [`DropReason`](crate::inbound::DropReason)s.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// A header or compound packet failed validation
    #[error("Invalid RTP packet format: {0}")]
    InvalidPacket(String),

    /// A packet could not be laid out on the wire
    #[error("Failed to encode packet: {0}")]
    EncodeError(String),

    #[error("Buffer too small for packet: need {required} but have {available}")]
    BufferTooSmall {
        required: usize,
        available: usize,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Socket failure; the kind is kept so callers can tell timeouts and
    /// interruptions from hard failures
    #[error("IO error ({kind:?}): {message}")]
    IoError {
        kind: io::ErrorKind,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RTCP error: {0}")]
    RtcpError(String),

    #[error("SRTP error: {0}")]
    SrtpError(String),

    /// The session can no longer carry media, e.g. after leaving
    #[error("RTP session error: {0}")]
    SessionError(String),

    /// Identifiers or buffers ran out
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl Error {
    /// The IO error kind, for socket failures
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::IoError { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
