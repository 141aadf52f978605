//! Error types for the camgate bridge.

use thiserror::Error;

/// Result type alias for camgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not reach or handshake with the MJPEG source
    #[error("Cannot connect to MJPEG source: {0}")]
    Connect(String),

    /// Malformed stream data; the read position has been resynchronized
    /// and the caller may retry after a short backoff
    #[error("Recoverable demux error: {0}")]
    DemuxRecoverable(String),

    /// Unrecoverable stream termination; the stream handle must be dropped
    #[error("Fatal demux error: {0}")]
    DemuxFatal(String),

    /// SDP offer/answer exchange failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Illegal peer connection state transition or terminal transport state
    #[error("Transport state error: {0}")]
    TransportState(String),

    /// Peer connection operation failed
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// No registered connection with the given ID
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Media track operation failed
    #[error("Media track error: {0}")]
    MediaTrack(String),

    /// Frame encoding failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Analysis collaborator request failed
    #[error("Analysis request failed: {0}")]
    Analysis(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the operation may be retried after a backoff interval.
    /// Only recoverable demux errors qualify; everything else is terminal
    /// for the operation that produced it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::DemuxRecoverable(_))
    }

    /// Whether this error terminates the stream handle it came from
    pub fn is_fatal_demux(&self) -> bool {
        matches!(self, Error::DemuxFatal(_))
    }

    /// Whether this error originates in configuration
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Connect("connection refused".to_string());
        assert_eq!(
            err.to_string(),
            "Cannot connect to MJPEG source: connection refused"
        );

        let err = Error::DemuxRecoverable("bad JPEG payload".to_string());
        assert_eq!(err.to_string(), "Recoverable demux error: bad JPEG payload");

        let err = Error::Negotiation("no common codec".to_string());
        assert_eq!(err.to_string(), "Negotiation failed: no common codec");
    }

    #[test]
    fn test_recoverable_predicate() {
        assert!(Error::DemuxRecoverable("x".to_string()).is_recoverable());
        assert!(!Error::DemuxFatal("x".to_string()).is_recoverable());
        assert!(!Error::Connect("x".to_string()).is_recoverable());
        assert!(!Error::Negotiation("x".to_string()).is_recoverable());
    }

    #[test]
    fn test_fatal_demux_predicate() {
        assert!(Error::DemuxFatal("end of stream".to_string()).is_fatal_demux());
        assert!(!Error::DemuxRecoverable("x".to_string()).is_fatal_demux());
    }

    #[test]
    fn test_config_error_predicate() {
        assert!(Error::InvalidConfig("bad port".to_string()).is_config_error());
        assert!(!Error::Connect("x".to_string()).is_config_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
