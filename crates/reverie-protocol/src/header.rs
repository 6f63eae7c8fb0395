use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Every message that can travel on the invocation stream.
///
/// Codes are grouped by high bits: `0x0000..` control, `0x0400..` commands
/// (SDK to runtime), `0x8000..` notifications (runtime to SDK). The signal
/// notification sits in a reserved slot at the top of the notification
/// range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // Control
    Start = 0x0000,
    Suspension = 0x0001,
    Error = 0x0002,
    End = 0x0003,
    EntryAck = 0x0004,
    ProposeRunCompletion = 0x0005,

    // Commands
    Input = 0x0400,
    Output = 0x0401,
    GetState = 0x0402,
    GetStateKeys = 0x0403,
    SetState = 0x0404,
    ClearState = 0x0405,
    ClearAllState = 0x0406,
    GetPromise = 0x0407,
    PeekPromise = 0x0408,
    CompletePromise = 0x0409,
    Sleep = 0x040A,
    Call = 0x040B,
    OneWayCall = 0x040C,
    SendSignal = 0x040D,
    Run = 0x040E,
    AttachInvocation = 0x040F,
    GetInvocationOutput = 0x0410,
    CompleteAwakeable = 0x0411,

    // Notifications
    GetStateCompletion = 0x8002,
    GetStateKeysCompletion = 0x8003,
    GetPromiseCompletion = 0x8007,
    PeekPromiseCompletion = 0x8008,
    CompletePromiseCompletion = 0x8009,
    SleepCompletion = 0x800A,
    CallCompletion = 0x800B,
    RunCompletion = 0x800E,
    AttachInvocationCompletion = 0x800F,
    GetInvocationOutputCompletion = 0x8010,
    CallInvocationIdCompletion = 0x801B,
    Signal = 0xFBFF,
}

impl MessageType {
    pub fn from_code(code: u16) -> Result<Self, ProtocolError> {
        Ok(match code {
            0x0000 => Self::Start,
            0x0001 => Self::Suspension,
            0x0002 => Self::Error,
            0x0003 => Self::End,
            0x0004 => Self::EntryAck,
            0x0005 => Self::ProposeRunCompletion,
            0x0400 => Self::Input,
            0x0401 => Self::Output,
            0x0402 => Self::GetState,
            0x0403 => Self::GetStateKeys,
            0x0404 => Self::SetState,
            0x0405 => Self::ClearState,
            0x0406 => Self::ClearAllState,
            0x0407 => Self::GetPromise,
            0x0408 => Self::PeekPromise,
            0x0409 => Self::CompletePromise,
            0x040A => Self::Sleep,
            0x040B => Self::Call,
            0x040C => Self::OneWayCall,
            0x040D => Self::SendSignal,
            0x040E => Self::Run,
            0x040F => Self::AttachInvocation,
            0x0410 => Self::GetInvocationOutput,
            0x0411 => Self::CompleteAwakeable,
            0x8002 => Self::GetStateCompletion,
            0x8003 => Self::GetStateKeysCompletion,
            0x8007 => Self::GetPromiseCompletion,
            0x8008 => Self::PeekPromiseCompletion,
            0x8009 => Self::CompletePromiseCompletion,
            0x800A => Self::SleepCompletion,
            0x800B => Self::CallCompletion,
            0x800E => Self::RunCompletion,
            0x800F => Self::AttachInvocationCompletion,
            0x8010 => Self::GetInvocationOutputCompletion,
            0x801B => Self::CallInvocationIdCompletion,
            0xFBFF => Self::Signal,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// SDK-to-runtime command recorded in the journal.
    pub fn is_command(self) -> bool {
        (self.code() & 0xFC00) == 0x0400
    }

    /// Runtime-to-SDK completion or signal.
    pub fn is_notification(self) -> bool {
        (self.code() & 0x8000) != 0
    }
}

/// Frame flag bits.
///
/// `COMPLETED` marks a replayed command whose result is already merged
/// into the command body; `REQUIRES_ACK` asks the runtime to ack the
/// entry once durably recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageFlags(u16);

impl MessageFlags {
    pub const NONE: Self = Self(0);
    pub const COMPLETED: Self = Self(0x0001);
    pub const REQUIRES_ACK: Self = Self(0x0002);

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// The 8-byte frame header: type, flags, payload length, big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub ty: MessageType,
    pub flags: MessageFlags,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(ty: MessageType, flags: MessageFlags, length: u32) -> Self {
        Self { ty, flags, length }
    }

    /// Append the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.ty.code());
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.length);
    }

    /// Parse a header from a buffer holding at least [`HEADER_LEN`] bytes.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        debug_assert!(buf.remaining() >= HEADER_LEN);
        let ty = MessageType::from_code(buf.get_u16())?;
        let flags = MessageFlags::from_bits(buf.get_u16());
        let length = buf.get_u32();
        Ok(Self { ty, flags, length })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn header_round_trips_exactly() {
        let header = FrameHeader::new(
            MessageType::Call,
            MessageFlags::COMPLETED.union(MessageFlags::REQUIRES_ACK),
            0xDEAD_BEEF,
        );
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_wire_order_is_big_endian() {
        let header = FrameHeader::new(MessageType::Input, MessageFlags::NONE, 1);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader::new(MessageType::End, MessageFlags::NONE, 0).encode(&mut buf);
        buf[0] = 0x7F;
        buf[1] = 0x7F;
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::UnknownMessageType(0x7F7F))
        ));
    }

    #[test]
    fn category_predicates() {
        assert!(MessageType::Call.is_command());
        assert!(!MessageType::Call.is_notification());
        assert!(MessageType::CallCompletion.is_notification());
        assert!(MessageType::Signal.is_notification());
        assert!(!MessageType::Start.is_command());
        assert!(!MessageType::Start.is_notification());
    }

    #[test]
    fn call_completion_codes_are_distinct() {
        assert_ne!(
            MessageType::CallCompletion.code(),
            MessageType::CallInvocationIdCompletion.code()
        );
    }
}
