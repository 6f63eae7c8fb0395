use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::decoder::{Decoder, RawMessage};
use crate::error::ProtocolError;
use crate::header::{FrameHeader, HEADER_LEN, MessageFlags, MessageType};

const READ_CHUNK: usize = 16 * 1024;

/// Serialize a message directly behind its frame header into `buf`.
///
/// One reservation, one pass: the body is prost-encoded straight into the
/// outgoing buffer, no intermediate allocation.
pub fn encode_frame(
    buf: &mut BytesMut,
    ty: MessageType,
    flags: MessageFlags,
    msg: &impl Message,
) {
    let body_len = msg.encoded_len();
    buf.reserve(HEADER_LEN + body_len);
    FrameHeader::new(ty, flags, body_len as u32).encode(buf);
    msg.encode(buf)
        .expect("BytesMut grows on demand, encoding cannot run out of space");
}

/// Buffered frame writer over an async byte sink.
///
/// Frames accumulate in an internal buffer; nothing reaches the sink
/// until an explicit `flush`.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    pub fn write_message(&mut self, ty: MessageType, flags: MessageFlags, msg: &impl Message) {
        encode_frame(&mut self.buf, ty, flags, msg);
    }

    /// A frame with an empty body, e.g. `End`.
    pub fn write_header_only(&mut self, ty: MessageType, flags: MessageFlags) {
        self.buf.reserve(HEADER_LEN);
        FrameHeader::new(ty, flags, 0).encode(&mut self.buf);
    }

    /// Append pre-encoded frames staged elsewhere.
    pub fn write_raw(&mut self, frames: Bytes) {
        self.buf.extend_from_slice(&frames);
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Push everything buffered to the sink and flush it.
    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        if !self.buf.is_empty() {
            let chunk = self.buf.split();
            trace!(len = chunk.len(), "flushing buffered frames");
            self.inner.write_all(&chunk).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Frame reader over an async byte source.
///
/// Clean end of stream at a frame boundary yields `None`; a stream that
/// ends mid-frame is a protocol error.
pub struct FrameReader<R> {
    inner: R,
    decoder: Decoder,
    chunk_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, READ_CHUNK)
    }

    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            decoder: Decoder::default(),
            chunk_size,
        }
    }

    pub async fn read_frame(&mut self) -> Result<Option<RawMessage>, ProtocolError> {
        loop {
            if let Some(msg) = self.decoder.consume_next()? {
                trace!(ty = ?msg.ty(), len = msg.payload.len(), "frame decoded");
                return Ok(Some(msg));
            }
            let mut chunk = BytesMut::with_capacity(self.chunk_size);
            let n = self.inner.read_buf(&mut chunk).await?;
            if n == 0 {
                return if self.decoder.is_at_frame_boundary() {
                    Ok(None)
                } else {
                    Err(ProtocolError::UnexpectedEof)
                };
            }
            self.decoder.push(chunk.freeze());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EndMessage, EntryAckMessage, StartMessage};

    #[test_log::test(tokio::test)]
    async fn writer_buffers_until_flush() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (_, write_half) = tokio::io::split(client);
        let mut writer = FrameWriter::new(write_half);

        writer.write_message(
            MessageType::EntryAck,
            MessageFlags::NONE,
            &EntryAckMessage { entry_index: 1 },
        );
        assert!(writer.pending_bytes() > 0);

        writer.flush().await.unwrap();
        assert_eq!(writer.pending_bytes(), 0);

        let mut received = vec![0u8; writer.pending_bytes() + 64];
        let n = server.read(&mut received).await.unwrap();
        assert!(n >= HEADER_LEN);
    }

    #[test_log::test(tokio::test)]
    async fn round_trip_through_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let (read_half, _keep_write) = tokio::io::split(client);
        let (_keep_read, write_half) = tokio::io::split(server);

        let mut writer = FrameWriter::new(write_half);
        let mut reader = FrameReader::with_chunk_size(read_half, 7);

        let start = StartMessage {
            debug_id: "inv-42".to_owned(),
            known_entries: 2,
            random_seed: 9,
            ..Default::default()
        };
        writer.write_message(MessageType::Start, MessageFlags::NONE, &start);
        writer.write_header_only(MessageType::End, MessageFlags::NONE);
        writer.flush().await.unwrap();

        let first = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(first.ty(), MessageType::Start);
        assert_eq!(first.decode_as::<StartMessage>().unwrap(), start);

        let second = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(second.ty(), MessageType::End);
        assert_eq!(second.decode_as::<EndMessage>().unwrap(), EndMessage {});
    }

    #[test_log::test(tokio::test)]
    async fn clean_eof_at_boundary_yields_none() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, _w) = tokio::io::split(client);
        let (_r, write_half) = tokio::io::split(server);

        let mut writer = FrameWriter::new(write_half);
        writer.write_header_only(MessageType::End, MessageFlags::NONE);
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(read_half);
        assert!(reader.read_frame().await.unwrap().is_some());
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn truncated_stream_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, _w) = tokio::io::split(client);
        let (_r, mut write_half) = tokio::io::split(server);

        // A header promising 10 payload bytes, then only 3 before EOF.
        let mut buf = BytesMut::new();
        FrameHeader::new(MessageType::Input, MessageFlags::NONE, 10).encode(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        write_half.write_all(&buf).await.unwrap();
        write_half.shutdown().await.unwrap();
        drop(write_half);

        let mut reader = FrameReader::new(read_half);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.to_string(), "stream ended with incomplete message");
    }
}
