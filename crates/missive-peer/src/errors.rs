use missive_wire::MessageError;

/// Error surfaced by a [`Peer`](crate::Peer), either as the failure of a
/// local call or as a [`PeerEvent::Error`](crate::PeerEvent::Error).
#[derive(Debug, Clone)]
pub enum PeerError {
    /// A well-formed JSON frame that violates the message schema. The
    /// offending frame was dropped; the connection stays up.
    InvalidMessage { detail: String },
    /// Transport-level failure: non-JSON bytes or a socket error. Ingestion
    /// continues after the next delimiter where possible.
    Streaming { detail: String },
    /// The peer has disconnected; sends and receives no longer work.
    Disconnected,
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::InvalidMessage { detail } => write!(f, "invalid message: {detail}"),
            PeerError::Streaming { detail } => write!(f, "streaming error: {detail}"),
            PeerError::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl std::error::Error for PeerError {}

/// Error from operating on a [`Correspondence`](crate::Correspondence).
#[derive(Debug)]
pub enum CorrespondenceError {
    /// The remote side terminated the correspondence with an error frame.
    Remote(MessageError),
    /// Read attempted after the read side closed and its buffer drained.
    Unreadable,
    /// Write attempted after `finish` or `error` closed the write side.
    Unwritable,
    /// The owning peer disconnected mid-exchange.
    Disconnected,
    /// The cancellation token fired while waiting.
    Cancelled,
    /// A read handler failed.
    Hook(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for CorrespondenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrespondenceError::Remote(e) => write!(f, "remote error: {e}"),
            CorrespondenceError::Unreadable => write!(f, "correspondence is no longer readable"),
            CorrespondenceError::Unwritable => write!(f, "correspondence is no longer writable"),
            CorrespondenceError::Disconnected => write!(f, "peer disconnected"),
            CorrespondenceError::Cancelled => write!(f, "cancelled"),
            CorrespondenceError::Hook(e) => write!(f, "read handler failed: {e}"),
        }
    }
}

impl std::error::Error for CorrespondenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CorrespondenceError::Remote(e) => Some(e),
            CorrespondenceError::Hook(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
