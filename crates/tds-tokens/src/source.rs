//! Byte sources feeding the token decoders.
//!
//! The decoder never talks to a socket directly. It consumes a
//! [`ResponseSource`]: a sequential little-endian reader over reassembled
//! packet payloads. The framing layer implements this trait over real I/O;
//! [`BytesSource`] implements it over memory, which is how decrypted cell
//! plaintext is re-read through a plaintext type and how tests feed
//! fixtures.

use async_trait::async_trait;
use bytes::{Buf, Bytes};

use crate::error::ProtocolError;
use crate::packet::{DEFAULT_PACKET_SIZE, PacketType};

/// Sequential reader over a framed TDS response.
///
/// All integer reads are little-endian. Reads are bounded by the message:
/// running past the final packet of a message yields
/// [`ProtocolError::UnexpectedEof`], which the decoders surface as a stream
/// violation.
#[async_trait]
pub trait ResponseSource: Send {
    /// Start reading the next message and return its packet type.
    async fn begin_read(&mut self) -> Result<PacketType, ProtocolError>;

    /// Read one byte.
    async fn read_u8(&mut self) -> Result<u8, ProtocolError>;

    /// Read a little-endian `u16`.
    async fn read_u16(&mut self) -> Result<u16, ProtocolError>;

    /// Read a little-endian `u32`.
    async fn read_u32(&mut self) -> Result<u32, ProtocolError>;

    /// Read a little-endian `u64`.
    async fn read_u64(&mut self) -> Result<u64, ProtocolError>;

    /// Read a little-endian `i32`.
    async fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.read_u32().await? as i32)
    }

    /// Fill `buf` completely or fail.
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError>;

    /// Resize the receive buffer after an ENVCHANGE packet-size change.
    async fn resize_buffer(&mut self, size: usize) -> Result<(), ProtocolError>;

    /// Currently negotiated receive buffer size.
    fn buffer_size(&self) -> usize;

    /// Read exactly `len` bytes into an owned buffer.
    async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; len];
        self.read_full(&mut buf).await?;
        Ok(buf)
    }

    /// Read a UCS-2 string of `char_count` characters.
    async fn read_ucs2(&mut self, char_count: usize) -> Result<String, ProtocolError> {
        let raw = self.read_bytes(char_count * 2).await?;
        crate::codec::decode_ucs2(&raw)
            .ok_or_else(|| ProtocolError::StringEncoding("invalid UCS-2 payload".into()))
    }

    /// Read a `B_VARCHAR` (1-byte character count + UCS-2).
    async fn read_b_varchar(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u8().await? as usize;
        self.read_ucs2(len).await
    }

    /// Read a `US_VARCHAR` (2-byte character count + UCS-2).
    async fn read_us_varchar(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16().await? as usize;
        self.read_ucs2(len).await
    }

    /// Read a `B_VARBYTE` (1-byte length + raw bytes).
    async fn read_b_varbyte(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u8().await? as usize;
        self.read_bytes(len).await
    }

    /// Read a `US_VARBYTE` (2-byte length + raw bytes).
    async fn read_us_varbyte(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u16().await? as usize;
        self.read_bytes(len).await
    }
}

/// In-memory [`ResponseSource`].
///
/// Wraps a byte buffer and serves it as a single-message response. This is
/// the re-read vehicle for decrypted Always Encrypted cells and the fixture
/// carrier for tests.
#[derive(Debug)]
pub struct BytesSource {
    packet_type: PacketType,
    data: Bytes,
    buffer_size: usize,
}

impl BytesSource {
    /// Wrap a buffer as a tabular-reply message.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_packet_type(PacketType::TabularResult, data)
    }

    /// Wrap a buffer declaring a specific packet type.
    pub fn with_packet_type(packet_type: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            data: data.into(),
            buffer_size: DEFAULT_PACKET_SIZE,
        }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn ensure(&self, n: usize) -> Result<(), ProtocolError> {
        if self.data.remaining() < n {
            Err(ProtocolError::UnexpectedEof)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResponseSource for BytesSource {
    async fn begin_read(&mut self) -> Result<PacketType, ProtocolError> {
        Ok(self.packet_type)
    }

    async fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    async fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.data.get_u16_le())
    }

    async fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.data.get_u32_le())
    }

    async fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.data.get_u64_le())
    }

    async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.ensure(buf.len())?;
        self.data.copy_to_slice(buf);
        Ok(())
    }

    async fn resize_buffer(&mut self, size: usize) -> Result<(), ProtocolError> {
        self.buffer_size = size;
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
