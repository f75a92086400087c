//! The thrown-exception analog for handler code.

use missive_peer::CorrespondenceError;

/// What a handler failed with.
///
/// Carries an optional machine-readable kind and an optional human-readable
/// message; the default exception handler substitutes `"UnknownError"` /
/// `"Unexpected error occurred!"` for whichever is missing before answering
/// the remote side.
#[derive(Debug, Clone, Default)]
pub struct Fault {
    kind: Option<String>,
    message: Option<String>,
}

impl Fault {
    /// A fault with both a kind and a message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            message: Some(message.into()),
        }
    }

    /// A fault with a message only.
    pub fn anonymous(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.message) {
            (Some(kind), Some(message)) => write!(f, "{kind}: {message}"),
            (Some(kind), None) => write!(f, "{kind}"),
            (None, Some(message)) => write!(f, "{message}"),
            (None, None) => write!(f, "unknown fault"),
        }
    }
}

impl std::error::Error for Fault {}

impl From<CorrespondenceError> for Fault {
    fn from(e: CorrespondenceError) -> Self {
        match e {
            CorrespondenceError::Remote(remote) => Fault::new(remote.kind, remote.message),
            CorrespondenceError::Unreadable => {
                Fault::new("UnreadableCorrespondence", e.to_string())
            }
            CorrespondenceError::Unwritable => {
                Fault::new("UnwritableCorrespondence", e.to_string())
            }
            CorrespondenceError::Disconnected => Fault::new("PeerDisconnected", e.to_string()),
            CorrespondenceError::Cancelled => Fault::new("Cancelled", e.to_string()),
            CorrespondenceError::Hook(source) => Fault::anonymous(source.to_string()),
        }
    }
}

impl From<serde_json::Error> for Fault {
    fn from(e: serde_json::Error) -> Self {
        Fault::new("SerializationError", e.to_string())
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Fault::new("IoError", e.to_string())
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Fault::anonymous(message)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Fault::anonymous(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_their_kind_and_message() {
        let fault = Fault::from(CorrespondenceError::Remote(
            missive_wire::MessageError::new("Quota", "over the line"),
        ));
        assert_eq!(fault.kind(), Some("Quota"));
        assert_eq!(fault.message(), Some("over the line"));
    }

    #[test]
    fn display_copes_with_missing_halves() {
        assert_eq!(Fault::new("K", "m").to_string(), "K: m");
        assert_eq!(Fault::anonymous("m").to_string(), "m");
        assert_eq!(Fault::default().to_string(), "unknown fault");
    }
}
