use reverie_protocol::ProtocolError;
use reverie_types::{CodecError, HandlerError, TerminalError, codes};

/// Umbrella error for everything that can go wrong inside an invocation.
///
/// `Terminal` ends the invocation through the output frame and is never
/// retried; every other variant surfaces as a transient error so the
/// runtime retries, except `Aborted` which propagates silently.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("{message}")]
    Retryable { message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invocation aborted")]
    Aborted,
    #[error("cannot {operation} while {state}")]
    IllegalState {
        state: &'static str,
        operation: &'static str,
    },
    #[error("replayed journal mismatch at index {index}: expected {expected}, found {actual}")]
    JournalMismatch {
        index: u32,
        expected: &'static str,
        actual: String,
    },
    #[error("unknown handler {service}/{handler}")]
    UnknownHandler { service: String, handler: String },
}

impl Error {
    /// The failure code reported on the wire for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::Terminal(t) => t.code,
            Self::Retryable { .. } | Self::Codec(_) => codes::INTERNAL,
            Self::Protocol(_) | Self::IllegalState { .. } => codes::PROTOCOL_VIOLATION,
            Self::JournalMismatch { .. } => codes::JOURNAL_MISMATCH,
            Self::Aborted => codes::ABORTED,
            Self::UnknownHandler { .. } => codes::INTERNAL,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

impl From<HandlerError> for Error {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Terminal(t) => Self::Terminal(t),
            HandlerError::Retryable { message } => Self::Retryable { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        assert_eq!(Error::Terminal(TerminalError::new(409, "x")).code(), 409);
        assert_eq!(
            Error::Retryable {
                message: "y".into()
            }
            .code(),
            codes::INTERNAL
        );
        assert_eq!(
            Error::Protocol(ProtocolError::UnexpectedEof).code(),
            codes::PROTOCOL_VIOLATION
        );
        assert_eq!(
            Error::JournalMismatch {
                index: 3,
                expected: "Sleep",
                actual: "Call".into()
            }
            .code(),
            codes::JOURNAL_MISMATCH
        );
        assert_eq!(Error::Aborted.code(), codes::ABORTED);
    }
}
