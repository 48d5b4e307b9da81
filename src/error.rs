use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures of the transport or of the wire codec.
///
/// A tracker that answers with a well-formed error or warning does not end up
/// here; see [`crate::types::Response`].
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce URI: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported tracker URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("could not resolve tracker address {addr:?}")]
    Resolve {
        addr: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("{phase}: I/O timeout after {timeout:?} waiting for the tracker")]
    Timeout {
        phase: &'static str,
        timeout: Duration,
    },

    #[error("{phase}: {source}")]
    Io {
        phase: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{phase}: transaction IDs do not match (sent {sent}, received {received})")]
    TransactionMismatch {
        phase: &'static str,
        sent: u32,
        received: u32,
    },

    #[error("{phase}: tracker responded with unexpected action {action}")]
    UnexpectedAction { phase: &'static str, action: u32 },

    #[error("{phase}: {detail}")]
    Malformed { phase: &'static str, detail: String },

    #[error("connect: tracker refused the connection: {0}")]
    ConnectRejected(String),

    #[error("tracker responded with HTTP status {0}")]
    HttpStatus(u16),

    #[error("malformed bencode payload: {0}")]
    Decode(#[from] serde_bencode::Error),

    #[error("request cannot be encoded: {0}")]
    Unencodable(String),
}

impl TrackerError {
    pub(crate) fn io(phase: &'static str) -> impl FnOnce(io::Error) -> TrackerError {
        move |source| TrackerError::Io { phase, source }
    }

    pub(crate) fn malformed(phase: &'static str, detail: impl Into<String>) -> TrackerError {
        TrackerError::Malformed {
            phase,
            detail: detail.into(),
        }
    }

    /// The tracker did not answer before the read deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TrackerError::Timeout { .. })
    }

    /// The tracker answered, but with bytes that break the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TrackerError::TransactionMismatch { .. }
                | TrackerError::UnexpectedAction { .. }
                | TrackerError::Malformed { .. }
                | TrackerError::Decode(_)
        )
    }

    /// The tracker refused the request at the transport level.
    pub fn is_rejection(&self) -> bool {
        match self {
            TrackerError::HttpStatus(code) => (400..500).contains(code),
            TrackerError::ConnectRejected(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let timeout = TrackerError::Timeout {
            phase: "announce",
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_protocol_violation());

        let mismatch = TrackerError::TransactionMismatch {
            phase: "connect",
            sent: 1,
            received: 2,
        };
        assert!(mismatch.is_protocol_violation());
        assert!(!mismatch.is_timeout());

        assert!(TrackerError::HttpStatus(400).is_rejection());
        assert!(!TrackerError::HttpStatus(502).is_rejection());
    }

    #[test]
    fn test_error_messages() {
        let err = TrackerError::malformed("announce", "unexpected announce response length: 27");
        assert_eq!(
            err.to_string(),
            "announce: unexpected announce response length: 27"
        );
    }
}
