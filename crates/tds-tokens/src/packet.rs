//! TDS packet framing primitives.
//!
//! Every TDS message is carried in one or more packets with an 8-byte
//! header. The token decoder only needs enough of the framing layer to
//! recognize the reply packet type and to let a framed byte source
//! reassemble payloads; request-side packet construction is limited to the
//! attention signal.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Size of the TDS packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Default negotiated packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Maximum packet size accepted from an ENVCHANGE resize.
pub const MAX_PACKET_SIZE: usize = 32767;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response from the server.
    TabularResult = 0x04,
    /// Attention signal (query cancellation).
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Federated authentication token.
    FedAuthToken = 0x08,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Tds7Login = 0x10,
    /// SSPI authentication.
    Sspi = 0x11,
    /// Pre-login packet.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::BulkLoad),
            0x08 => Ok(Self::FedAuthToken),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Tds7Login),
            0x11 => Ok(Self::Sspi),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::UnexpectedPacketType(value)),
        }
    }
}

/// Packet status bit: this packet ends the message.
pub const STATUS_END_OF_MESSAGE: u8 = 0x01;

/// Packet header preceding every packet payload.
///
/// The length field is big-endian and includes the header itself; all other
/// multi-byte protocol integers are little-endian.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Status bits.
    pub status: u8,
    /// Total packet length including the header (big-endian on the wire).
    pub length: u16,
    /// Server process id.
    pub spid: u16,
    /// Sequence number within the message.
    pub packet_id: u8,
    /// Unused window field.
    pub window: u8,
}

impl PacketHeader {
    /// Decode a header from exactly [`PACKET_HEADER_SIZE`] bytes.
    pub fn decode(mut src: impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::UnexpectedEof);
        }
        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status = src.get_u8();
        let length = src.get_u16();
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();
        if (length as usize) < PACKET_HEADER_SIZE {
            return Err(ProtocolError::bad_stream(format!(
                "packet length {length} smaller than header"
            )));
        }
        Ok(Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        })
    }

    /// Encode the header into a buffer.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status);
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Whether this packet is the last of its message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.status & STATUS_END_OF_MESSAGE != 0
    }

    /// Payload length carried by this packet.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.length as usize - PACKET_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::TabularResult,
            status: STATUS_END_OF_MESSAGE,
            length: 42,
            spid: 7,
            packet_id: 1,
            window: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), PACKET_HEADER_SIZE);

        let decoded = PacketHeader::decode(&buf[..]).expect("decodes");
        assert_eq!(decoded.packet_type, PacketType::TabularResult);
        assert!(decoded.is_end_of_message());
        assert_eq!(decoded.length, 42);
        assert_eq!(decoded.payload_len(), 34);
    }

    #[test]
    fn header_rejects_undersized_length() {
        let bytes = [0x04, 0x01, 0x00, 0x04, 0x00, 0x00, 0x01, 0x00];
        assert!(PacketHeader::decode(&bytes[..]).is_err());
    }

    #[test]
    fn header_rejects_unknown_type() {
        let bytes = [0x55, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00];
        assert!(matches!(
            PacketHeader::decode(&bytes[..]),
            Err(ProtocolError::UnexpectedPacketType(0x55))
        ));
    }
}
