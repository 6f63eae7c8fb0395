use bytes::{Bytes, BytesMut};
use prost::Message;

use crate::error::ProtocolError;
use crate::header::{FrameHeader, HEADER_LEN, MessageFlags, MessageType};

/// One frame lifted off the stream: parsed header, undecoded body.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn ty(&self) -> MessageType {
        self.header.ty
    }

    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    /// Decode the body as a specific message type.
    pub fn decode_as<M: Message + Default>(&self) -> Result<M, ProtocolError> {
        M::decode(self.payload.clone()).map_err(|source| ProtocolError::Decode {
            ty: self.header.ty,
            source,
        })
    }
}

enum DecoderState {
    WaitingHeader,
    WaitingPayload(FrameHeader),
}

/// Incremental frame decoder over a chunked byte stream.
///
/// Chunks are pushed as they arrive (multi-segment input is fine); each
/// `consume_next` call takes exactly the bytes of one frame and leaves
/// any partial remainder buffered, so a pipe that already holds bytes for
/// an incomplete frame never wedges.
pub struct Decoder {
    state: DecoderState,
    buf: BytesMut,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            state: DecoderState::WaitingHeader,
            buf: BytesMut::new(),
        }
    }
}

impl Decoder {
    pub fn push(&mut self, chunk: Bytes) {
        self.buf.extend_from_slice(&chunk);
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn consume_next(&mut self) -> Result<Option<RawMessage>, ProtocolError> {
        loop {
            match self.state {
                DecoderState::WaitingHeader => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let header = FrameHeader::decode(&mut self.buf)?;
                    self.state = DecoderState::WaitingPayload(header);
                }
                DecoderState::WaitingPayload(header) => {
                    if self.buf.len() < header.length as usize {
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(header.length as usize).freeze();
                    self.state = DecoderState::WaitingHeader;
                    return Ok(Some(RawMessage { header, payload }));
                }
            }
        }
    }

    /// True when the stream may end here without truncating a frame.
    pub fn is_at_frame_boundary(&self) -> bool {
        matches!(self.state, DecoderState::WaitingHeader) && self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EntryAckMessage, StartMessage};

    fn frame_bytes(ty: MessageType, flags: MessageFlags, msg: &impl Message) -> Bytes {
        let mut buf = BytesMut::new();
        crate::io::encode_frame(&mut buf, ty, flags, msg);
        buf.freeze()
    }

    #[test]
    fn decodes_one_frame_from_one_chunk() {
        let msg = EntryAckMessage { entry_index: 4 };
        let mut decoder = Decoder::default();
        decoder.push(frame_bytes(MessageType::EntryAck, MessageFlags::NONE, &msg));

        let raw = decoder.consume_next().unwrap().unwrap();
        assert_eq!(raw.ty(), MessageType::EntryAck);
        assert_eq!(raw.decode_as::<EntryAckMessage>().unwrap(), msg);
        assert!(decoder.consume_next().unwrap().is_none());
        assert!(decoder.is_at_frame_boundary());
    }

    #[test]
    fn reassembles_frames_split_across_chunks() {
        let msg = StartMessage {
            debug_id: "inv-split".to_owned(),
            known_entries: 1,
            ..Default::default()
        };
        let bytes = frame_bytes(MessageType::Start, MessageFlags::NONE, &msg);

        let mut decoder = Decoder::default();
        // Byte-at-a-time worst case.
        for b in bytes.iter() {
            decoder.push(Bytes::copy_from_slice(&[*b]));
        }
        let raw = decoder.consume_next().unwrap().unwrap();
        assert_eq!(raw.decode_as::<StartMessage>().unwrap(), msg);
    }

    #[test]
    fn two_frames_in_one_chunk_come_out_in_order() {
        let first = frame_bytes(
            MessageType::EntryAck,
            MessageFlags::NONE,
            &EntryAckMessage { entry_index: 1 },
        );
        let second = frame_bytes(
            MessageType::EntryAck,
            MessageFlags::NONE,
            &EntryAckMessage { entry_index: 2 },
        );
        let mut both = BytesMut::new();
        both.extend_from_slice(&first);
        both.extend_from_slice(&second);

        let mut decoder = Decoder::default();
        decoder.push(both.freeze());
        assert_eq!(
            decoder
                .consume_next()
                .unwrap()
                .unwrap()
                .decode_as::<EntryAckMessage>()
                .unwrap()
                .entry_index,
            1
        );
        assert_eq!(
            decoder
                .consume_next()
                .unwrap()
                .unwrap()
                .decode_as::<EntryAckMessage>()
                .unwrap()
                .entry_index,
            2
        );
    }

    #[test]
    fn zero_length_payload_is_valid() {
        let mut buf = BytesMut::new();
        FrameHeader::new(MessageType::End, MessageFlags::NONE, 0).encode(&mut buf);

        let mut decoder = Decoder::default();
        decoder.push(buf.freeze());
        let raw = decoder.consume_next().unwrap().unwrap();
        assert_eq!(raw.ty(), MessageType::End);
        assert!(raw.payload.is_empty());
    }

    #[test]
    fn partial_frame_is_not_a_boundary() {
        let bytes = frame_bytes(
            MessageType::EntryAck,
            MessageFlags::NONE,
            &EntryAckMessage { entry_index: 9 },
        );
        let mut decoder = Decoder::default();
        decoder.push(bytes.slice(..bytes.len() - 1));
        assert!(decoder.consume_next().unwrap().is_none());
        assert!(!decoder.is_at_frame_boundary());
    }
}
