use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known failure codes carried on the wire.
///
/// The values mirror HTTP where a mapping exists; 570/571 are
/// protocol-level codes outside the HTTP range.
pub mod codes {
    /// Uncaught handler failure, retryable.
    pub const INTERNAL: u16 = 500;
    /// Invocation aborted (external cancel or stream closure).
    pub const ABORTED: u16 = 409;
    /// No mutually supported manifest version.
    pub const UNSUPPORTED_MEDIA_TYPE: u16 = 415;
    /// Replayed journal disagrees with handler code.
    pub const JOURNAL_MISMATCH: u16 = 570;
    /// Malformed or unexpected wire state.
    pub const PROTOCOL_VIOLATION: u16 = 571;
}

/// A non-retryable business failure raised by handler code.
///
/// Terminal errors are recorded in the output of the invocation; the
/// runtime will not re-invoke the handler for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalError {
    pub code: u16,
    pub message: String,
}

impl TerminalError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Terminal error with the generic internal code.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for TerminalError {}

/// Outcome classification for a failed handler or side-effect closure.
///
/// `Terminal` surfaces as the invocation output and stops retries;
/// `Retryable` surfaces as a transient error frame (or a local retry for
/// side effects with a retry policy).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("{message}")]
    Retryable { message: String },
}

impl HandlerError {
    pub fn terminal(code: u16, message: impl Into<String>) -> Self {
        Self::Terminal(TerminalError::new(code, message))
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Whether this failure must not be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// The code reported on the wire for this failure.
    pub fn code(&self) -> u16 {
        match self {
            Self::Terminal(t) => t.code,
            Self::Retryable { .. } => codes::INTERNAL,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Terminal(t) => &t.message,
            Self::Retryable { message } => message,
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Retryable {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_error_displays_code_and_message() {
        let err = TerminalError::new(409, "conflict");
        assert_eq!(err.to_string(), "[409] conflict");
    }

    #[test]
    fn handler_error_classification() {
        let terminal = HandlerError::terminal(404, "missing");
        assert!(terminal.is_terminal());
        assert_eq!(terminal.code(), 404);

        let retryable = HandlerError::retryable("flaky downstream");
        assert!(!retryable.is_terminal());
        assert_eq!(retryable.code(), codes::INTERNAL);
        assert_eq!(retryable.message(), "flaky downstream");
    }
}
