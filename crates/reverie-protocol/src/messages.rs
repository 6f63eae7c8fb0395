//! Bodies of the frames on the invocation stream.
//!
//! Hand-maintained in prost generated-code idiom: explicit field tags,
//! companion modules for oneofs. Completable commands carry a `result`
//! oneof that stays empty on the live path and is filled by the runtime
//! when a replayed frame has the `COMPLETED` flag set.

use bytes::Bytes;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Failure {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Void {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateEntry {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateKeys {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub keys: Vec<Bytes>,
}

// --- Control

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartMessage {
    /// Raw invocation id bytes; awakeable ids are derived from these.
    #[prost(bytes = "bytes", tag = "1")]
    pub id: Bytes,
    /// Human-readable invocation id for logs.
    #[prost(string, tag = "2")]
    pub debug_id: String,
    #[prost(uint32, tag = "3")]
    pub known_entries: u32,
    /// Eager state, only meaningful when `partial_state` is false.
    #[prost(message, repeated, tag = "4")]
    pub state_map: Vec<StateEntry>,
    #[prost(bool, tag = "5")]
    pub partial_state: bool,
    #[prost(string, tag = "6")]
    pub key: String,
    #[prost(uint64, tag = "7")]
    pub random_seed: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SuspensionMessage {
    #[prost(uint32, repeated, tag = "1")]
    pub waiting_completions: Vec<u32>,
    #[prost(uint32, repeated, tag = "2")]
    pub waiting_signals: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorMessage {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint32, optional, tag = "3")]
    pub related_command_index: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EndMessage {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntryAckMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProposeRunCompletionMessage {
    #[prost(uint32, tag = "1")]
    pub result_completion_id: u32,
    /// The raw result bytes, not wrapped in a nested value message.
    #[prost(oneof = "propose_run_completion_message::Result", tags = "2, 3")]
    pub result: Option<propose_run_completion_message::Result>,
}

pub mod propose_run_completion_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "2")]
        Value(Bytes),
        #[prost(message, tag = "3")]
        Failure(super::Failure),
    }
}

// --- Commands

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InputCommandMessage {
    #[prost(message, repeated, tag = "1")]
    pub headers: Vec<Header>,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputCommandMessage {
    /// Always set on the wire; a void return carries an explicit empty
    /// value, never an absent result.
    #[prost(oneof = "output_command_message::Result", tags = "1, 2")]
    pub result: Option<output_command_message::Result>,
}

pub mod output_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "1")]
        Value(Bytes),
        #[prost(message, tag = "2")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateCommandMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
    #[prost(oneof = "get_state_command_message::Result", tags = "3, 4, 5")]
    pub result: Option<get_state_command_message::Result>,
}

pub mod get_state_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "3")]
        Value(Bytes),
        #[prost(message, tag = "4")]
        Void(super::Void),
        #[prost(message, tag = "5")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateKeysCommandMessage {
    #[prost(uint32, tag = "1")]
    pub completion_id: u32,
    #[prost(oneof = "get_state_keys_command_message::Result", tags = "2, 3")]
    pub result: Option<get_state_keys_command_message::Result>,
}

pub mod get_state_keys_command_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "2")]
        StateKeys(super::StateKeys),
        #[prost(message, tag = "3")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetStateCommandMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearStateCommandMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearAllStateCommandMessage {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPromiseCommandMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
    #[prost(oneof = "get_promise_command_message::Result", tags = "3, 4")]
    pub result: Option<get_promise_command_message::Result>,
}

pub mod get_promise_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "3")]
        Value(Bytes),
        #[prost(message, tag = "4")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeekPromiseCommandMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
    #[prost(oneof = "peek_promise_command_message::Result", tags = "3, 4, 5")]
    pub result: Option<peek_promise_command_message::Result>,
}

pub mod peek_promise_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "3")]
        Value(Bytes),
        #[prost(message, tag = "4")]
        Void(super::Void),
        #[prost(message, tag = "5")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletePromiseCommandMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
    #[prost(oneof = "complete_promise_command_message::Completion", tags = "3, 4")]
    pub completion: Option<complete_promise_command_message::Completion>,
    #[prost(oneof = "complete_promise_command_message::Result", tags = "5, 6")]
    pub result: Option<complete_promise_command_message::Result>,
}

pub mod complete_promise_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Completion {
        #[prost(bytes = "bytes", tag = "3")]
        CompletionValue(Bytes),
        #[prost(message, tag = "4")]
        CompletionFailure(super::Failure),
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "5")]
        Void(super::Void),
        #[prost(message, tag = "6")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SleepCommandMessage {
    /// Absolute wake-up time, milliseconds since the Unix epoch.
    #[prost(uint64, tag = "1")]
    pub wake_up_time: u64,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(oneof = "sleep_command_message::Result", tags = "4, 5")]
    pub result: Option<sleep_command_message::Result>,
}

pub mod sleep_command_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "4")]
        Void(super::Void),
        #[prost(message, tag = "5")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallCommandMessage {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub handler_name: String,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(string, optional, tag = "4")]
    pub idempotency_key: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub headers: Vec<Header>,
    #[prost(bytes = "bytes", tag = "6")]
    pub parameter: Bytes,
    /// Journal index reserved for the invocation-id notification; always
    /// the slot preceding `completion_id`.
    #[prost(uint32, tag = "7")]
    pub invocation_id_notification_idx: u32,
    #[prost(uint32, tag = "8")]
    pub completion_id: u32,
    #[prost(oneof = "call_command_message::Result", tags = "9, 10")]
    pub result: Option<call_command_message::Result>,
}

pub mod call_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "9")]
        Value(Bytes),
        #[prost(message, tag = "10")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OneWayCallCommandMessage {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub handler_name: String,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(string, optional, tag = "4")]
    pub idempotency_key: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub headers: Vec<Header>,
    #[prost(bytes = "bytes", tag = "6")]
    pub parameter: Bytes,
    /// Absolute delivery time (ms since epoch); zero means immediate.
    #[prost(uint64, tag = "7")]
    pub invoke_time: u64,
    #[prost(uint32, tag = "8")]
    pub invocation_id_notification_idx: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendSignalCommandMessage {
    #[prost(string, tag = "1")]
    pub target_invocation_id: String,
    #[prost(uint32, tag = "2")]
    pub signal_idx: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunCommandMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachInvocationCommandMessage {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
    #[prost(oneof = "attach_invocation_command_message::Result", tags = "3, 4")]
    pub result: Option<attach_invocation_command_message::Result>,
}

pub mod attach_invocation_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "3")]
        Value(Bytes),
        #[prost(message, tag = "4")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetInvocationOutputCommandMessage {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(uint32, tag = "2")]
    pub completion_id: u32,
    #[prost(oneof = "get_invocation_output_command_message::Result", tags = "3, 4, 5")]
    pub result: Option<get_invocation_output_command_message::Result>,
}

pub mod get_invocation_output_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "3")]
        Value(Bytes),
        #[prost(message, tag = "4")]
        Void(super::Void),
        #[prost(message, tag = "5")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompleteAwakeableCommandMessage {
    #[prost(string, tag = "1")]
    pub awakeable_id: String,
    #[prost(oneof = "complete_awakeable_command_message::Result", tags = "2, 3")]
    pub result: Option<complete_awakeable_command_message::Result>,
}

pub mod complete_awakeable_command_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "2")]
        Value(Bytes),
        #[prost(message, tag = "3")]
        Failure(super::Failure),
    }
}

// --- Notifications

/// Shared body of every journal-indexed completion notification.
///
/// All completion frame types decode through this one shape; the frame
/// header alone distinguishes them.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletionMessage {
    #[prost(uint32, tag = "1")]
    pub completion_id: u32,
    #[prost(oneof = "completion_message::Result", tags = "2, 3, 4, 5, 6")]
    pub result: Option<completion_message::Result>,
}

pub mod completion_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "2")]
        Value(Bytes),
        #[prost(message, tag = "3")]
        Void(super::Void),
        #[prost(message, tag = "4")]
        Failure(super::Failure),
        #[prost(string, tag = "5")]
        InvocationId(String),
        #[prost(message, tag = "6")]
        StateKeys(super::StateKeys),
    }
}

/// Signal-indexed notification: awakeable resolutions and cancellations.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalMessage {
    #[prost(uint32, tag = "1")]
    pub idx: u32,
    #[prost(oneof = "signal_message::Result", tags = "2, 3, 4")]
    pub result: Option<signal_message::Result>,
}

pub mod signal_message {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "2")]
        Value(Bytes),
        #[prost(message, tag = "3")]
        Void(super::Void),
        #[prost(message, tag = "4")]
        Failure(super::Failure),
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn start_message_round_trip() {
        let msg = StartMessage {
            id: Bytes::from_static(b"\x01\x02"),
            debug_id: "inv-1".to_owned(),
            known_entries: 3,
            state_map: vec![StateEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
            }],
            partial_state: false,
            key: "object-key".to_owned(),
            random_seed: 42,
        };
        let bytes = msg.encode_to_vec();
        let back = StartMessage::decode(&bytes[..]).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn output_with_empty_value_keeps_the_discriminator() {
        let msg = OutputCommandMessage {
            result: Some(output_command_message::Result::Value(Bytes::new())),
        };
        let bytes = msg.encode_to_vec();
        // The value field must be present on the wire even when empty.
        assert!(!bytes.is_empty());
        let back = OutputCommandMessage::decode(&bytes[..]).unwrap();
        assert_eq!(
            back.result,
            Some(output_command_message::Result::Value(Bytes::new()))
        );
    }

    #[test]
    fn completion_decodes_each_result_shape() {
        for result in [
            completion_message::Result::Value(Bytes::from_static(b"x")),
            completion_message::Result::Void(Void {}),
            completion_message::Result::Failure(Failure {
                code: 500,
                message: "boom".to_owned(),
            }),
            completion_message::Result::InvocationId("inv-9".to_owned()),
            completion_message::Result::StateKeys(StateKeys {
                keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            }),
        ] {
            let msg = CompletionMessage {
                completion_id: 7,
                result: Some(result.clone()),
            };
            let back = CompletionMessage::decode(&msg.encode_to_vec()[..]).unwrap();
            assert_eq!(back.completion_id, 7);
            assert_eq!(back.result, Some(result));
        }
    }
}
