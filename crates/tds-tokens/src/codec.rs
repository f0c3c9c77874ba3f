//! In-memory codec utilities for TDS wire strings.
//!
//! TDS strings are UCS-2 little-endian with a length prefix counting
//! *characters*, not bytes. These helpers operate on [`Buf`] for the cases
//! where a structure has already been pulled into memory (LOGINACK bodies,
//! ENVCHANGE records, test fixtures). Streaming equivalents live on the
//! [`ResponseSource`](crate::source::ResponseSource) trait.

use bytes::{Buf, BufMut};

/// Read a length-prefixed UTF-16LE string (1-byte length, in characters).
pub fn read_b_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 1 {
        return None;
    }
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a length-prefixed UTF-16LE string (2-byte length, in characters).
pub fn read_us_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 2 {
        return None;
    }
    let len = src.get_u16_le() as usize;
    read_utf16_string(src, len)
}

/// Read a length-prefixed byte blob (1-byte length).
pub fn read_b_varbyte(src: &mut impl Buf) -> Option<Vec<u8>> {
    if src.remaining() < 1 {
        return None;
    }
    let len = src.get_u8() as usize;
    if src.remaining() < len {
        return None;
    }
    let mut buf = vec![0u8; len];
    src.copy_to_slice(&mut buf);
    Some(buf)
}

/// Read a length-prefixed byte blob (2-byte length).
pub fn read_us_varbyte(src: &mut impl Buf) -> Option<Vec<u8>> {
    if src.remaining() < 2 {
        return None;
    }
    let len = src.get_u16_le() as usize;
    if src.remaining() < len {
        return None;
    }
    let mut buf = vec![0u8; len];
    src.copy_to_slice(&mut buf);
    Some(buf)
}

/// Read a UTF-16LE string of the given character length.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Option<String> {
    if src.remaining() < char_count * 2 {
        return None;
    }
    let mut chars = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        chars.push(src.get_u16_le());
    }
    String::from_utf16(&chars).ok()
}

/// Decode a raw UTF-16LE byte slice.
///
/// Byte-order marks are not interpreted; the protocol is always
/// little-endian.
pub fn decode_ucs2(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let chars: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&chars).ok()
}

/// Write a length-prefixed UTF-16LE string (1-byte length).
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let chars: Vec<u16> = s.encode_utf16().collect();
    let len = chars.len().min(255) as u8;
    dst.put_u8(len);
    for &c in &chars[..len as usize] {
        dst.put_u16_le(c);
    }
}

/// Write a length-prefixed UTF-16LE string (2-byte length).
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let chars: Vec<u16> = s.encode_utf16().collect();
    let len = chars.len().min(65535) as u16;
    dst.put_u16_le(len);
    for &c in &chars[..len as usize] {
        dst.put_u16_le(c);
    }
}

/// Write a UTF-16LE string without a length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}
