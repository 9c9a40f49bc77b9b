/// Errors surfaced by the sense core.
///
/// Operational device conditions (USB unplugged, display duplicated, ...) are not
/// errors; they arrive as [`SystemEvent`](crate::SystemEvent)s.
#[derive(Debug, thiserror::Error)]
pub enum SrError {
    #[error("SR service not available at {endpoint} after {attempts} attempt(s)")]
    ServiceUnavailable { endpoint: String, attempts: u32 },

    #[error("Protocol mismatch: client speaks v{client}, service speaks v{service}")]
    ProtocolMismatch { client: u64, service: u64 },

    #[error("Handshake rejected by service: {0}")]
    HandshakeRejected(String),

    #[error("Context is invalid, destroy it and create a new one")]
    ContextInvalid,

    #[error("Sense not available on this device: {0}")]
    SenseUnavailable(&'static str),

    #[error("Service at {0} already hosts a session from this process")]
    SessionInUse(String),

    #[error("Context destroyed with {0} stream(s) still open")]
    OpenStreams(usize),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Timeout waiting for service")]
    Timeout,

    #[error("Connection to service closed")]
    Disconnected,

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SrError {
    /// Whether a host should retry, or destroy and recreate its context, after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SrError::ServiceUnavailable { .. }
                | SrError::ContextInvalid
                | SrError::Disconnected
                | SrError::Timeout
                | SrError::SessionInUse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(SrError::ContextInvalid.is_recoverable());
        assert!(SrError::ServiceUnavailable {
            endpoint: "127.0.0.1:7227".into(),
            attempts: 3
        }
        .is_recoverable());
        assert!(!SrError::ProtocolMismatch { client: 2, service: 1 }.is_recoverable());
        assert!(!SrError::SenseUnavailable("Camera").is_recoverable());
    }

    #[test]
    fn test_display_names_endpoint() {
        let err = SrError::ServiceUnavailable {
            endpoint: "127.0.0.1:7227".into(),
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "SR service not available at 127.0.0.1:7227 after 4 attempt(s)"
        );
    }
}
