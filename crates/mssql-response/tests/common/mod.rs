//! Shared byte-fixture builders for the response integration tests.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use tds_tokens::{
    PACKET_HEADER_SIZE, PacketHeader, PacketType, STATUS_END_OF_MESSAGE, TokenType, TypeId, codec,
};

/// Encode a DONE token (tag included).
pub fn done(status: u16, row_count: u64) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Done as u8);
    buf.put_u16_le(status);
    buf.put_u16_le(0);
    buf.put_u64_le(row_count);
    buf.to_vec()
}

/// Encode a COLMETADATA token declaring INT4 columns with the given names.
pub fn int4_colmetadata(names: &[&str]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::ColMetaData as u8);
    buf.put_u16_le(names.len() as u16);
    for name in names {
        buf.put_u32_le(0); // user type
        buf.put_u16_le(0); // flags
        buf.put_u8(TypeId::Int4 as u8);
        codec::write_b_varchar(&mut buf, name);
    }
    buf.to_vec()
}

/// Encode a ROW token of INT4 cells.
pub fn int4_row(values: &[i32]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Row as u8);
    for v in values {
        buf.put_i32_le(*v);
    }
    buf.to_vec()
}

/// Encode an NBCROW token over INT4 columns; `None` cells go into the null
/// bitmap.
pub fn int4_nbc_row(cells: &[Option<i32>]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::NbcRow as u8);
    let mut bitmap = vec![0u8; cells.len().div_ceil(8)];
    for (i, cell) in cells.iter().enumerate() {
        if cell.is_none() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    buf.put_slice(&bitmap);
    for v in cells.iter().flatten() {
        buf.put_i32_le(*v);
    }
    buf.to_vec()
}

/// Encode an ERROR token.
pub fn error_token(number: i32, class: u8, message: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32_le(number);
    body.put_u8(1); // state
    body.put_u8(class);
    codec::write_us_varchar(&mut body, message);
    codec::write_b_varchar(&mut body, "srv");
    codec::write_b_varchar(&mut body, "");
    body.put_i32_le(1);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Error as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.to_vec()
}

/// Encode an ENVCHANGE database-change token: `E3 <size> 01 <new> <old>`.
pub fn envchange_database(new: &str, old: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(1);
    codec::write_b_varchar(&mut body, new);
    codec::write_b_varchar(&mut body, old);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::EnvChange as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.to_vec()
}

/// Encode an ENVCHANGE routing token.
pub fn envchange_routing(server: &str, port: u16) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(20);
    body.put_u16_le((1 + 2 + 2 + server.len() * 2) as u16);
    body.put_u8(0); // TCP
    body.put_u16_le(port);
    codec::write_us_varchar(&mut body, server);
    body.put_u16_le(0); // old value

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::EnvChange as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.to_vec()
}

/// Encode an SSPI token.
pub fn sspi(payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Sspi as u8);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Encode a RETURNVALUE token carrying an INTN value.
pub fn return_value_intn(name: &str, value: Option<i32>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::ReturnValue as u8);
    buf.put_u16_le(1); // ordinal
    codec::write_b_varchar(&mut buf, name);
    buf.put_u8(1); // status
    buf.put_u32_le(0); // user type
    buf.put_u16_le(0); // flags
    buf.put_u8(TypeId::IntN as u8);
    buf.put_u8(4); // max length
    match value {
        Some(v) => {
            buf.put_u8(4);
            buf.put_i32_le(v);
        }
        None => buf.put_u8(0),
    }
    buf.to_vec()
}

/// Wrap a payload into one TDS packet.
pub fn packet(packet_type: PacketType, last: bool, payload: &[u8]) -> Vec<u8> {
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

/// Wrap a payload into a single-packet tabular-reply message.
pub fn reply_message(payload: &[u8]) -> Vec<u8> {
    packet(PacketType::TabularResult, true, payload)
}
