//! Packet framing over async I/O.
//!
//! [`FramedSource`] reassembles TDS packets into the sequential byte
//! stream the token decoders consume: it reads packet headers as needed
//! and serves payload bytes across packet boundaries, so a multi-packet
//! response is parsed incrementally instead of being buffered whole.
//!
//! [`PacketSink`] is the sibling writer half. The split exists for
//! cancellation: an attention packet must go out while the reader half is
//! blocked mid-response.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tds_tokens::{
    DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketType, ProtocolError,
    STATUS_END_OF_MESSAGE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tds_tokens::ResponseSource;

/// A [`ResponseSource`] over an async transport.
#[derive(Debug)]
pub struct FramedSource<T> {
    io: T,
    buf: BytesMut,
    packet_size: usize,
    /// The current message's final packet has been read.
    end_of_message: bool,
    /// A message is in progress; primitive reads are allowed.
    in_message: bool,
}

impl<T> FramedSource<T>
where
    T: AsyncRead + Unpin + Send,
{
    /// Wrap a read transport.
    pub fn new(io: T) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(DEFAULT_PACKET_SIZE),
            packet_size: DEFAULT_PACKET_SIZE,
            end_of_message: true,
            in_message: false,
        }
    }

    /// Consume the source, returning the transport.
    pub fn into_inner(self) -> T {
        self.io
    }

    async fn read_packet(&mut self) -> Result<PacketHeader, ProtocolError> {
        let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
        self.io.read_exact(&mut header_bytes).await?;
        let header = PacketHeader::decode(&header_bytes[..])?;

        if header.payload_len() > self.packet_size {
            tracing::warn!(
                payload = header.payload_len(),
                negotiated = self.packet_size,
                "server packet exceeds negotiated size"
            );
        }

        let start = self.buf.len();
        self.buf.resize(start + header.payload_len(), 0);
        self.io.read_exact(&mut self.buf[start..]).await?;

        self.end_of_message = header.is_end_of_message();
        Ok(header)
    }

    /// Ensure `n` payload bytes are buffered, pulling further packets of
    /// the current message as needed.
    async fn ensure(&mut self, n: usize) -> Result<(), ProtocolError> {
        if !self.in_message {
            return Err(ProtocolError::bad_stream("read before BeginRead"));
        }
        while self.buf.remaining() < n {
            if self.end_of_message {
                return Err(ProtocolError::UnexpectedEof);
            }
            self.read_packet().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T> ResponseSource for FramedSource<T>
where
    T: AsyncRead + Unpin + Send,
{
    async fn begin_read(&mut self) -> Result<PacketType, ProtocolError> {
        // Leftover payload of an abandoned message is dropped; the next
        // header starts a fresh message.
        self.buf.clear();
        let header = self.read_packet().await?;
        self.in_message = true;
        Ok(header.packet_type)
    }

    async fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1).await?;
        Ok(self.buf.get_u8())
    }

    async fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2).await?;
        Ok(self.buf.get_u16_le())
    }

    async fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4).await?;
        Ok(self.buf.get_u32_le())
    }

    async fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8).await?;
        Ok(self.buf.get_u64_le())
    }

    async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.ensure(buf.len()).await?;
        self.buf.copy_to_slice(buf);
        Ok(())
    }

    async fn resize_buffer(&mut self, size: usize) -> Result<(), ProtocolError> {
        self.packet_size = size;
        self.buf.reserve(size.saturating_sub(self.buf.capacity()));
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.packet_size
    }
}

/// Writer half of the framed connection, used for the attention signal.
#[derive(Debug)]
pub struct PacketSink<T> {
    io: T,
}

impl<T> PacketSink<T>
where
    T: AsyncWrite + Unpin + Send,
{
    /// Wrap a write transport.
    pub fn new(io: T) -> Self {
        Self { io }
    }

    /// Send a TDS attention packet, requesting cancellation of the
    /// in-flight request. The server confirms with a DONE carrying the
    /// ATTN bit.
    pub async fn send_attention(&mut self) -> Result<(), ProtocolError> {
        let header = PacketHeader {
            packet_type: PacketType::Attention,
            status: STATUS_END_OF_MESSAGE,
            length: PACKET_HEADER_SIZE as u16,
            spid: 0,
            packet_id: 1,
            window: 0,
        };
        let mut bytes = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        header.encode(&mut bytes);
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        tracing::debug!("sent attention request");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn packet(packet_type: PacketType, last: bool, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        PacketHeader {
            packet_type,
            status: if last { STATUS_END_OF_MESSAGE } else { 0 },
            length: (PACKET_HEADER_SIZE + payload.len()) as u16,
            spid: 0,
            packet_id: 1,
            window: 0,
        }
        .encode(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[tokio::test]
    async fn single_packet_message() {
        let wire = packet(PacketType::TabularResult, true, &[0x2A, 0x00]);
        let mut src = FramedSource::new(&wire[..]);

        assert_eq!(
            src.begin_read().await.unwrap(),
            PacketType::TabularResult
        );
        assert_eq!(src.read_u16().await.unwrap(), 42);
        assert!(matches!(
            src.read_u8().await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn payload_spans_packets() {
        // A u32 split across two packets of the same message.
        let mut wire = packet(PacketType::TabularResult, false, &[0x2A, 0x00]);
        wire.extend_from_slice(&packet(PacketType::TabularResult, true, &[0x00, 0x00]));

        let mut src = FramedSource::new(&wire[..]);
        src.begin_read().await.unwrap();
        assert_eq!(src.read_u32().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn read_before_begin_is_rejected() {
        let wire = packet(PacketType::TabularResult, true, &[0x01]);
        let mut src = FramedSource::new(&wire[..]);
        assert!(src.read_u8().await.is_err());
    }

    #[tokio::test]
    async fn attention_packet_bytes() {
        let mut out = Vec::new();
        PacketSink::new(&mut out).send_attention().await.unwrap();
        assert_eq!(out.len(), PACKET_HEADER_SIZE);
        assert_eq!(out[0], PacketType::Attention as u8);
        assert_eq!(out[1], STATUS_END_OF_MESSAGE);
        assert_eq!(u16::from_be_bytes([out[2], out[3]]), 8);
    }

    #[tokio::test]
    async fn resize_tracks_negotiated_size() {
        let wire = packet(PacketType::TabularResult, true, &[]);
        let mut src = FramedSource::new(&wire[..]);
        assert_eq!(src.buffer_size(), DEFAULT_PACKET_SIZE);
        src.resize_buffer(8192).await.unwrap();
        assert_eq!(src.buffer_size(), 8192);
    }
}
