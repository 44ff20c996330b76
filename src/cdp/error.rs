use std::fmt;

/// Errors that can occur on the CDP wire.
#[derive(Debug, Clone)]
pub enum CdpError {
    /// WebSocket connection could not be established.
    Connection(String),

    /// Connection attempt exceeded the configured timeout.
    ConnectionTimeout,

    /// A command did not receive a response within the configured timeout.
    CommandTimeout {
        /// The CDP method that timed out.
        method: String,
    },

    /// Chrome returned a CDP protocol-level error.
    Protocol {
        /// The CDP error code (e.g., -32000).
        code: i64,
        /// The CDP error message.
        message: String,
    },

    /// The channel closed while commands were in flight. Every pending
    /// command observes this; policy for what happens next lives in the
    /// orchestrator, not here.
    TransportGone,

    /// The connection delivered a frame that could not be parsed; the
    /// session is closed and will accept no further commands.
    Poisoned(String),

    /// Failed to interpret a well-formed message from Chrome.
    InvalidResponse(String),

    /// Internal error (transport task died, channel closed).
    Internal(String),
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "CDP connection error: {msg}"),
            Self::ConnectionTimeout => write!(f, "CDP connection timed out"),
            Self::CommandTimeout { method } => {
                write!(f, "CDP command timed out: {method}")
            }
            Self::Protocol { code, message } => {
                write!(f, "CDP protocol error ({code}): {message}")
            }
            Self::TransportGone => write!(f, "CDP transport gone"),
            Self::Poisoned(msg) => write!(f, "CDP connection poisoned: {msg}"),
            Self::InvalidResponse(msg) => {
                write!(f, "CDP invalid response: {msg}")
            }
            Self::Internal(msg) => write!(f, "CDP internal error: {msg}"),
        }
    }
}

impl std::error::Error for CdpError {}

impl From<CdpError> for crate::error::ServerError {
    fn from(e: CdpError) -> Self {
        use crate::error::ErrorKind;
        let kind = match &e {
            CdpError::Connection(_)
            | CdpError::ConnectionTimeout
            | CdpError::TransportGone
            | CdpError::Poisoned(_) => ErrorKind::TransportGone,
            CdpError::CommandTimeout { .. }
            | CdpError::Protocol { .. }
            | CdpError::InvalidResponse(_)
            | CdpError::Internal(_) => ErrorKind::HandlerRaised,
        };
        Self::new(kind, e.to_string())
    }
}
