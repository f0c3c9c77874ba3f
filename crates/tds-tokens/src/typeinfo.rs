//! TYPE_INFO parsing and cell decoding.
//!
//! A TYPE_INFO block is a type-id byte followed by type-dependent
//! parameters. [`TypeInfo::decode`] consumes the parameters (the caller has
//! already consumed the type-id byte, since COLMETADATA interleaves it with
//! flags) and [`TypeInfo::read_value`] is the cell reader: it decodes one
//! cell of that type from any [`ResponseSource`].
//!
//! The reader is deliberately stateless so the same `TypeInfo` works
//! against the live wire and against an in-memory buffer: the Always
//! Encrypted path re-reads decrypted plaintext through the plaintext
//! type's reader.

use bytes::Bytes;
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone};

use crate::error::ProtocolError;
use crate::source::ResponseSource;
use crate::types::TypeId;
use crate::value::SqlValue;

/// SQL Server collation attached to character types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collation {
    /// Locale id with version/flag bits.
    pub lcid: u32,
    /// Sort id.
    pub sort_id: u8,
}

/// Parsed TYPE_INFO for one column or parameter.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// TDS type id.
    pub type_id: TypeId,
    /// User type code from the enclosing metadata.
    pub user_type: u32,
    /// Flags from the enclosing metadata.
    pub flags: u16,
    /// Maximum length for variable-length types.
    pub max_length: Option<u32>,
    /// Precision for decimal types.
    pub precision: Option<u8>,
    /// Scale for decimal and time types.
    pub scale: Option<u8>,
    /// Collation for character types.
    pub collation: Option<Collation>,
}

/// NULL sentinel for 2-byte-counted values.
const USHORT_NULL: u16 = 0xFFFF;

/// Max-length marker turning a 2-byte-counted type into PLP.
const PLP_MARKER: u32 = 0xFFFF;

/// PLP NULL sentinel.
const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

impl TypeInfo {
    /// Construct a minimal TYPE_INFO for a fixed type (used by tests and
    /// synthetic plaintext metadata).
    #[must_use]
    pub fn fixed(type_id: TypeId) -> Self {
        Self {
            type_id,
            user_type: 0,
            flags: 0,
            max_length: None,
            precision: None,
            scale: None,
            collation: None,
        }
    }

    /// Parse the type-dependent parameters following a type-id byte.
    pub async fn decode<S>(src: &mut S, type_id_byte: u8) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let type_id = TypeId::from_u8(type_id_byte)
            .ok_or_else(|| ProtocolError::bad_stream(format!("unknown type id 0x{type_id_byte:02X}")))?;

        let mut info = Self::fixed(type_id);

        match type_id {
            // Fixed-length types carry no parameters.
            TypeId::Null
            | TypeId::Int1
            | TypeId::Bit
            | TypeId::Int2
            | TypeId::Int4
            | TypeId::Int8
            | TypeId::Float4
            | TypeId::Float8
            | TypeId::Money
            | TypeId::Money4
            | TypeId::DateTime
            | TypeId::DateTime4
            | TypeId::Date => {}

            // 1-byte max length.
            TypeId::IntN
            | TypeId::BitN
            | TypeId::FloatN
            | TypeId::MoneyN
            | TypeId::DateTimeN
            | TypeId::Guid
            | TypeId::Char
            | TypeId::VarChar
            | TypeId::Binary
            | TypeId::VarBinary => {
                info.max_length = Some(u32::from(src.read_u8().await?));
            }

            // 1-byte length + precision + scale.
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                info.max_length = Some(u32::from(src.read_u8().await?));
                info.precision = Some(src.read_u8().await?);
                info.scale = Some(src.read_u8().await?);
            }

            // 2-byte max length + collation.
            TypeId::BigVarChar | TypeId::BigChar | TypeId::NChar | TypeId::NVarChar => {
                info.max_length = Some(u32::from(src.read_u16().await?));
                info.collation = Some(Self::decode_collation(src).await?);
            }

            // 2-byte max length, no collation.
            TypeId::BigVarBinary | TypeId::BigBinary => {
                info.max_length = Some(u32::from(src.read_u16().await?));
            }

            // Scale only.
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                info.scale = Some(src.read_u8().await?);
            }

            // Deprecated LOB types: 4-byte max length, collation for the
            // character flavors. The trailing table name is part of
            // COLMETADATA, not TYPE_INFO.
            TypeId::Text | TypeId::NText => {
                info.max_length = Some(src.read_u32().await?);
                info.collation = Some(Self::decode_collation(src).await?);
            }
            TypeId::Image => {
                info.max_length = Some(src.read_u32().await?);
            }

            TypeId::Xml => {
                let schema_present = src.read_u8().await?;
                if schema_present != 0 {
                    let _ = src.read_b_varchar().await?; // db name
                    let _ = src.read_b_varchar().await?; // owning schema
                    let _ = src.read_us_varchar().await?; // schema collection
                }
            }

            TypeId::Udt => {
                info.max_length = Some(u32::from(src.read_u16().await?));
                let _ = src.read_b_varchar().await?; // db name
                let _ = src.read_b_varchar().await?; // schema name
                let _ = src.read_b_varchar().await?; // type name
                let _ = src.read_us_varchar().await?; // assembly qualified name
            }

            TypeId::Variant => {
                info.max_length = Some(src.read_u32().await?);
            }

            TypeId::Tvp => {
                return Err(ProtocolError::bad_stream(
                    "table-valued parameter in result metadata",
                ));
            }
        }

        Ok(info)
    }

    async fn decode_collation<S>(src: &mut S) -> Result<Collation, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let lcid = src.read_u32().await?;
        let sort_id = src.read_u8().await?;
        Ok(Collation { lcid, sort_id })
    }

    /// Decode one cell of this type.
    ///
    /// Null encodings (zero length for byte-counted types, `0xFFFF` for
    /// 2-byte-counted types, the PLP sentinel, a zero textptr) produce
    /// [`SqlValue::Null`]. Encrypted columns declare a varbinary wire type,
    /// so their cells come back as ciphertext [`SqlValue::Binary`].
    pub async fn read_value<S>(&self, src: &mut S) -> Result<SqlValue, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        match self.type_id {
            TypeId::Null => Ok(SqlValue::Null),
            TypeId::Int1 => Ok(SqlValue::TinyInt(src.read_u8().await?)),
            TypeId::Bit => Ok(SqlValue::Bool(src.read_u8().await? != 0)),
            TypeId::Int2 => Ok(SqlValue::SmallInt(src.read_u16().await? as i16)),
            TypeId::Int4 => Ok(SqlValue::Int(src.read_i32().await?)),
            TypeId::Int8 => Ok(SqlValue::BigInt(src.read_u64().await? as i64)),
            TypeId::Float4 => Ok(SqlValue::Float(f32::from_bits(src.read_u32().await?))),
            TypeId::Float8 => Ok(SqlValue::Double(f64::from_bits(src.read_u64().await?))),
            TypeId::Money => {
                let raw = read_money8(src).await?;
                money_value(raw)
            }
            TypeId::Money4 => money_value(i64::from(src.read_i32().await?)),
            TypeId::DateTime => read_datetime(src).await,
            TypeId::DateTime4 => read_smalldatetime(src).await,

            TypeId::IntN => {
                let len = src.read_u8().await?;
                match len {
                    0 => Ok(SqlValue::Null),
                    1 => Ok(SqlValue::TinyInt(src.read_u8().await?)),
                    2 => Ok(SqlValue::SmallInt(src.read_u16().await? as i16)),
                    4 => Ok(SqlValue::Int(src.read_i32().await?)),
                    8 => Ok(SqlValue::BigInt(src.read_u64().await? as i64)),
                    n => Err(ProtocolError::bad_stream(format!("invalid INTN length {n}"))),
                }
            }
            TypeId::BitN => {
                let len = src.read_u8().await?;
                match len {
                    0 => Ok(SqlValue::Null),
                    1 => Ok(SqlValue::Bool(src.read_u8().await? != 0)),
                    n => Err(ProtocolError::bad_stream(format!("invalid BITN length {n}"))),
                }
            }
            TypeId::FloatN => {
                let len = src.read_u8().await?;
                match len {
                    0 => Ok(SqlValue::Null),
                    4 => Ok(SqlValue::Float(f32::from_bits(src.read_u32().await?))),
                    8 => Ok(SqlValue::Double(f64::from_bits(src.read_u64().await?))),
                    n => Err(ProtocolError::bad_stream(format!("invalid FLTN length {n}"))),
                }
            }
            TypeId::MoneyN => {
                let len = src.read_u8().await?;
                match len {
                    0 => Ok(SqlValue::Null),
                    4 => money_value(i64::from(src.read_i32().await?)),
                    8 => money_value(read_money8(src).await?),
                    n => Err(ProtocolError::bad_stream(format!("invalid MONEYN length {n}"))),
                }
            }
            TypeId::DateTimeN => {
                let len = src.read_u8().await?;
                match len {
                    0 => Ok(SqlValue::Null),
                    4 => read_smalldatetime(src).await,
                    8 => read_datetime(src).await,
                    n => Err(ProtocolError::bad_stream(format!(
                        "invalid DATETIMN length {n}"
                    ))),
                }
            }

            TypeId::Guid => {
                let len = src.read_u8().await?;
                match len {
                    0 => Ok(SqlValue::Null),
                    16 => {
                        let raw = src.read_bytes(16).await?;
                        Ok(SqlValue::Uuid(guid_from_wire(&raw)))
                    }
                    n => Err(ProtocolError::bad_stream(format!("invalid GUID length {n}"))),
                }
            }

            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                self.read_decimal(src).await
            }

            // Legacy byte-counted types: 0xFF is the NULL sentinel.
            TypeId::Char | TypeId::VarChar => {
                let len = src.read_u8().await?;
                if len == 0xFF {
                    return Ok(SqlValue::Null);
                }
                let raw = src.read_bytes(len as usize).await?;
                Ok(SqlValue::String(utf8_string(raw)?))
            }
            TypeId::Binary | TypeId::VarBinary => {
                let len = src.read_u8().await?;
                if len == 0xFF {
                    return Ok(SqlValue::Null);
                }
                let raw = src.read_bytes(len as usize).await?;
                Ok(SqlValue::Binary(Bytes::from(raw)))
            }

            TypeId::BigChar | TypeId::BigVarChar => {
                if self.type_id == TypeId::BigVarChar && self.max_length == Some(PLP_MARKER) {
                    return match read_plp(src).await? {
                        None => Ok(SqlValue::Null),
                        Some(raw) => Ok(SqlValue::String(utf8_string(raw)?)),
                    };
                }
                let len = src.read_u16().await?;
                if len == USHORT_NULL {
                    return Ok(SqlValue::Null);
                }
                let raw = src.read_bytes(len as usize).await?;
                Ok(SqlValue::String(utf8_string(raw)?))
            }

            TypeId::BigBinary | TypeId::BigVarBinary => {
                if self.type_id == TypeId::BigVarBinary && self.max_length == Some(PLP_MARKER) {
                    return match read_plp(src).await? {
                        None => Ok(SqlValue::Null),
                        Some(raw) => Ok(SqlValue::Binary(Bytes::from(raw))),
                    };
                }
                let len = src.read_u16().await?;
                if len == USHORT_NULL {
                    return Ok(SqlValue::Null);
                }
                let raw = src.read_bytes(len as usize).await?;
                Ok(SqlValue::Binary(Bytes::from(raw)))
            }

            TypeId::NChar | TypeId::NVarChar => {
                if self.type_id == TypeId::NVarChar && self.max_length == Some(PLP_MARKER) {
                    return match read_plp(src).await? {
                        None => Ok(SqlValue::Null),
                        Some(raw) => Ok(SqlValue::String(ucs2_string(&raw)?)),
                    };
                }
                let len = src.read_u16().await?;
                if len == USHORT_NULL {
                    return Ok(SqlValue::Null);
                }
                let raw = src.read_bytes(len as usize).await?;
                Ok(SqlValue::String(ucs2_string(&raw)?))
            }

            TypeId::Text => match read_textptr(src).await? {
                None => Ok(SqlValue::Null),
                Some(raw) => Ok(SqlValue::String(utf8_string(raw)?)),
            },
            TypeId::NText => match read_textptr(src).await? {
                None => Ok(SqlValue::Null),
                Some(raw) => Ok(SqlValue::String(ucs2_string(&raw)?)),
            },
            TypeId::Image => match read_textptr(src).await? {
                None => Ok(SqlValue::Null),
                Some(raw) => Ok(SqlValue::Binary(Bytes::from(raw))),
            },

            TypeId::Date => {
                let len = src.read_u8().await?;
                match len {
                    0 => Ok(SqlValue::Null),
                    3 => Ok(SqlValue::Date(read_date3(src).await?)),
                    n => Err(ProtocolError::bad_stream(format!("invalid DATE length {n}"))),
                }
            }
            TypeId::Time => {
                let len = src.read_u8().await?;
                if len == 0 {
                    return Ok(SqlValue::Null);
                }
                let scale = self.scale.unwrap_or(7);
                self.check_time_len(len, time_bytes_for_scale(scale))?;
                Ok(SqlValue::Time(read_scaled_time(src, scale).await?))
            }
            TypeId::DateTime2 => {
                let len = src.read_u8().await?;
                if len == 0 {
                    return Ok(SqlValue::Null);
                }
                let scale = self.scale.unwrap_or(7);
                self.check_time_len(len, time_bytes_for_scale(scale) + 3)?;
                let time = read_scaled_time(src, scale).await?;
                let date = read_date3(src).await?;
                Ok(SqlValue::DateTime(date.and_time(time)))
            }
            TypeId::DateTimeOffset => {
                let len = src.read_u8().await?;
                if len == 0 {
                    return Ok(SqlValue::Null);
                }
                let scale = self.scale.unwrap_or(7);
                self.check_time_len(len, time_bytes_for_scale(scale) + 5)?;
                let time = read_scaled_time(src, scale).await?;
                let date = read_date3(src).await?;
                let offset_minutes = src.read_u16().await? as i16;
                let offset = chrono::FixedOffset::east_opt(i32::from(offset_minutes) * 60)
                    .ok_or_else(|| {
                        ProtocolError::bad_stream(format!("invalid tz offset {offset_minutes}"))
                    })?;
                let value = offset
                    .from_local_datetime(&date.and_time(time))
                    .single()
                    .ok_or_else(|| ProtocolError::bad_stream("ambiguous datetimeoffset"))?;
                Ok(SqlValue::DateTimeOffset(value))
            }

            TypeId::Xml | TypeId::Udt => match read_plp(src).await? {
                None => Ok(SqlValue::Null),
                Some(raw) if self.type_id == TypeId::Xml => Ok(SqlValue::Xml(ucs2_string(&raw)?)),
                Some(raw) => Ok(SqlValue::Binary(Bytes::from(raw))),
            },

            TypeId::Variant => {
                let len = src.read_u32().await?;
                if len == 0 {
                    return Ok(SqlValue::Null);
                }
                let raw = src.read_bytes(len as usize).await?;
                Ok(SqlValue::Binary(Bytes::from(raw)))
            }

            TypeId::Tvp => Err(ProtocolError::bad_stream(
                "table-valued parameter in row data",
            )),
        }
    }

    async fn read_decimal<S>(&self, src: &mut S) -> Result<SqlValue, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let len = src.read_u8().await? as usize;
        if len == 0 {
            return Ok(SqlValue::Null);
        }
        if len < 2 || len > 17 {
            return Err(ProtocolError::bad_stream(format!(
                "invalid DECIMAL length {len}"
            )));
        }
        // Sign byte: 1 positive, 0 negative; mantissa is little-endian.
        let sign = src.read_u8().await?;
        let raw = src.read_bytes(len - 1).await?;
        let mut mantissa_bytes = [0u8; 16];
        mantissa_bytes[..raw.len()].copy_from_slice(&raw);
        let mantissa = u128::from_le_bytes(mantissa_bytes);
        let scale = u32::from(self.scale.unwrap_or(0));

        let mut value = rust_decimal::Decimal::try_from_i128_with_scale(mantissa as i128, scale)
            .map_err(|e| ProtocolError::bad_stream(format!("decimal out of range: {e}")))?;
        if sign == 0 {
            value.set_sign_negative(true);
        }
        Ok(SqlValue::Decimal(value))
    }

    fn check_time_len(&self, actual: u8, expected: usize) -> Result<(), ProtocolError> {
        if actual as usize != expected {
            return Err(ProtocolError::bad_stream(format!(
                "time value length {actual} does not match scale {:?}",
                self.scale
            )));
        }
        Ok(())
    }
}

async fn read_money8<S>(src: &mut S) -> Result<i64, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    // High half first on the wire, both halves little-endian.
    let hi = src.read_i32().await?;
    let lo = src.read_u32().await?;
    Ok((i64::from(hi) << 32) | i64::from(lo))
}

fn money_value(raw: i64) -> Result<SqlValue, ProtocolError> {
    let value = rust_decimal::Decimal::try_from_i128_with_scale(i128::from(raw), 4)
        .map_err(|e| ProtocolError::bad_stream(format!("money out of range: {e}")))?;
    Ok(SqlValue::Decimal(value))
}

async fn read_datetime<S>(src: &mut S) -> Result<SqlValue, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    // 4 bytes days since 1900-01-01 + 4 bytes 300ths of a second.
    let days = src.read_i32().await?;
    let time_300ths = src.read_u32().await?;

    let date = days_from(NaiveDate::from_ymd_opt(1900, 1, 1).expect("valid base date"), i64::from(days))?;
    let total_ms = (u64::from(time_300ths) * 1000) / 300;
    let secs = total_ms / 1000;
    let nanos = ((total_ms % 1000) * 1_000_000) as u32;
    let time = u32::try_from(secs)
        .ok()
        .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, nanos))
        .ok_or_else(|| ProtocolError::bad_stream("invalid DATETIME time fraction"))?;
    Ok(SqlValue::DateTime(date.and_time(time)))
}

async fn read_smalldatetime<S>(src: &mut S) -> Result<SqlValue, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    // 2 bytes days since 1900-01-01 + 2 bytes minutes since midnight.
    let days = src.read_u16().await?;
    let minutes = src.read_u16().await?;
    let date = days_from(NaiveDate::from_ymd_opt(1900, 1, 1).expect("valid base date"), i64::from(days))?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)
        .ok_or_else(|| ProtocolError::bad_stream("invalid SMALLDATETIME minutes"))?;
    Ok(SqlValue::DateTime(date.and_time(time)))
}

async fn read_date3<S>(src: &mut S) -> Result<NaiveDate, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    // 3 bytes little-endian: days since 0001-01-01.
    let raw = src.read_bytes(3).await?;
    let days = u32::from(raw[0]) | (u32::from(raw[1]) << 8) | (u32::from(raw[2]) << 16);
    days_from(
        NaiveDate::from_ymd_opt(1, 1, 1).expect("valid base date"),
        i64::from(days),
    )
}

fn days_from(base: NaiveDate, days: i64) -> Result<NaiveDate, ProtocolError> {
    base.checked_add_signed(Duration::days(days))
        .ok_or_else(|| ProtocolError::bad_stream(format!("date offset {days} out of range")))
}

async fn read_scaled_time<S>(src: &mut S, scale: u8) -> Result<NaiveTime, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    let width = time_bytes_for_scale(scale);
    let raw = src.read_bytes(width).await?;
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&raw);
    let intervals = u64::from_le_bytes(bytes);

    let nanos = match scale {
        0 => intervals * 1_000_000_000,
        1 => intervals * 100_000_000,
        2 => intervals * 10_000_000,
        3 => intervals * 1_000_000,
        4 => intervals * 100_000,
        5 => intervals * 10_000,
        6 => intervals * 1_000,
        _ => intervals * 100,
    };
    let secs = (nanos / 1_000_000_000) as u32;
    let nano_part = (nanos % 1_000_000_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nano_part)
        .ok_or_else(|| ProtocolError::bad_stream("time value past midnight"))
}

fn time_bytes_for_scale(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

/// SQL Server stores GUIDs mixed-endian: the first three groups are
/// little-endian, the last two big-endian.
fn guid_from_wire(raw: &[u8]) -> uuid::Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = raw[3];
    bytes[1] = raw[2];
    bytes[2] = raw[1];
    bytes[3] = raw[0];
    bytes[4] = raw[5];
    bytes[5] = raw[4];
    bytes[6] = raw[7];
    bytes[7] = raw[6];
    bytes[8..16].copy_from_slice(&raw[8..16]);
    uuid::Uuid::from_bytes(bytes)
}

fn utf8_string(raw: Vec<u8>) -> Result<String, ProtocolError> {
    String::from_utf8(raw).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

fn ucs2_string(raw: &[u8]) -> Result<String, ProtocolError> {
    crate::codec::decode_ucs2(raw)
        .ok_or_else(|| ProtocolError::StringEncoding("invalid UCS-2 payload".into()))
}

/// Read a PLP (partially length-prefixed) value: an 8-byte total length
/// (all-ones = NULL) followed by 4-byte-length chunks until a zero chunk.
async fn read_plp<S>(src: &mut S) -> Result<Option<Vec<u8>>, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    let total = src.read_u64().await?;
    if total == PLP_NULL {
        return Ok(None);
    }
    let mut out = Vec::new();
    loop {
        let chunk = src.read_u32().await? as usize;
        if chunk == 0 {
            break;
        }
        let mut buf = vec![0u8; chunk];
        src.read_full(&mut buf).await?;
        out.extend_from_slice(&buf);
    }
    Ok(Some(out))
}

/// Read a deprecated textptr-format LOB: a 1-byte textptr length (zero =
/// NULL), the textptr, an 8-byte timestamp, then a 4-byte data length and
/// the data.
async fn read_textptr<S>(src: &mut S) -> Result<Option<Vec<u8>>, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    let ptr_len = src.read_u8().await? as usize;
    if ptr_len == 0 {
        return Ok(None);
    }
    let _ = src.read_bytes(ptr_len).await?;
    let _ = src.read_bytes(8).await?; // timestamp
    let data_len = src.read_u32().await? as usize;
    Ok(Some(src.read_bytes(data_len).await?))
}
