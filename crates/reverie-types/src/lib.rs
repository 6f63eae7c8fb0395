pub mod codec;
pub mod error;
pub mod manifest;
pub mod retry;
pub mod target;
pub mod value;

pub use codec::{CodecError, Json, PayloadCodec};
pub use error::{HandlerError, TerminalError, codes};
pub use manifest::{
    HandlerType, Manifest, ManifestVersion, ProtocolMode, ServiceType, negotiate,
};
pub use retry::RetryPolicy;
pub use target::Target;
pub use value::CompletionValue;
