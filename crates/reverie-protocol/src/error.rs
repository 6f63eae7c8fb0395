use crate::header::MessageType;

/// Malformed or unexpected wire state.
///
/// Protocol errors are surfaced to the runtime as transient errors when
/// the stream is still writable; otherwise the stream is torn down.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("stream ended with incomplete message")]
    UnexpectedEof,
    #[error("unknown message type 0x{0:04x}")]
    UnknownMessageType(u16),
    #[error("failed to decode {ty:?} message: {source}")]
    Decode {
        ty: MessageType,
        #[source]
        source: prost::DecodeError,
    },
    #[error("received unexpected message: expected {expected}, got {actual:?}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: MessageType,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
