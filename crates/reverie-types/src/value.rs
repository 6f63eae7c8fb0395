use bytes::Bytes;

use crate::error::TerminalError;

/// The resolved outcome of a completion-bearing operation.
///
/// Each variant corresponds to one shape a completion notification can
/// carry. `StateKeys` is normalized to a JSON string array before handler
/// code sees it, so all state results share one deserialization path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionValue {
    /// Opaque result bytes; empty for void-typed successes.
    Success(Bytes),
    /// Explicit void marker (e.g. "not yet completed" from get-output).
    Void,
    /// The operation failed terminally.
    Failure(TerminalError),
    /// An invocation id, resolved for call/send handles.
    InvocationId(String),
}

impl CompletionValue {
    /// Unwrap success bytes; failures raise, `Void` maps to empty bytes.
    pub fn into_success(self) -> Result<Bytes, TerminalError> {
        match self {
            Self::Success(bytes) => Ok(bytes),
            Self::Void => Ok(Bytes::new()),
            Self::Failure(err) => Err(err),
            Self::InvocationId(id) => Ok(Bytes::from(id)),
        }
    }

    /// Unwrap success bytes, distinguishing the void marker as `None`.
    pub fn into_optional(self) -> Result<Option<Bytes>, TerminalError> {
        match self {
            Self::Void => Ok(None),
            other => other.into_success().map(Some),
        }
    }

    /// Unwrap an invocation id; anything else is a protocol-shaped mismatch
    /// surfaced as a terminal error.
    pub fn into_invocation_id(self) -> Result<String, TerminalError> {
        match self {
            Self::InvocationId(id) => Ok(id),
            Self::Failure(err) => Err(err),
            other => Err(TerminalError::new(
                crate::error::codes::PROTOCOL_VIOLATION,
                format!("expected invocation id completion, got {other:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn void_maps_to_empty_success() {
        assert_eq!(CompletionValue::Void.into_success().unwrap(), Bytes::new());
        assert_eq!(CompletionValue::Void.into_optional().unwrap(), None);
    }

    #[test]
    fn failure_propagates() {
        let v = CompletionValue::Failure(TerminalError::new(409, "conflict"));
        assert_eq!(v.into_success().unwrap_err().code, 409);
    }

    #[test]
    fn invocation_id_mismatch_is_protocol_violation() {
        let err = CompletionValue::Success(Bytes::from_static(b"x"))
            .into_invocation_id()
            .unwrap_err();
        assert_eq!(err.code, crate::error::codes::PROTOCOL_VIOLATION);
    }
}
