//! TDS response token structures and decoders.
//!
//! Tokens are the units of a server response: a tag byte followed by a
//! token-specific body. Most bodies are self-delimiting; ROW and NBCROW are
//! only interpretable against the most recent COLMETADATA, which is why the
//! row decoders take the current column list.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec;
use crate::crypto::{CekTable, CryptoMetadata};
use crate::error::ProtocolError;
use crate::source::ResponseSource;
use crate::typeinfo::TypeInfo;
use crate::types::{COLUMN_FLAG_ENCRYPTED, COLUMN_FLAG_NULLABLE};
use crate::value::SqlValue;

/// Token tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Return status of an RPC (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Result-set schema (COLMETADATA).
    ColMetaData = 0x81,
    /// Column ordering (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Output parameter (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null-bitmap-compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// SSPI authentication payload (SSPI).
    Sspi = 0xED,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Statement completion (DONE).
    Done = 0xFD,
    /// Procedure completion (DONEPROC).
    DoneProc = 0xFE,
    /// Completion inside a procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw tag byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x79 => Some(Self::ReturnStatus),
            0x81 => Some(Self::ColMetaData),
            0xA9 => Some(Self::Order),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAC => Some(Self::ReturnValue),
            0xAD => Some(Self::LoginAck),
            0xAE => Some(Self::FeatureExtAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xED => Some(Self::Sspi),
            0xEE => Some(Self::FedAuthInfo),
            0xFD => Some(Self::Done),
            0xFE => Some(Self::DoneProc),
            0xFF => Some(Self::DoneInProc),
            _ => None,
        }
    }
}

/// A decoded token as delivered to the consumer.
///
/// Reader failures travel on the same channel as the `Err` arm of
/// `Result<Token, _>`, so an error can never be mistaken for a token.
#[derive(Debug, Clone)]
pub enum Token {
    /// RPC return status.
    ReturnStatus(i32),
    /// Column ordering information.
    Order(Order),
    /// Result-set schema; shared with the reader's current-columns state.
    Columns(Arc<Vec<Column>>),
    /// One decoded row, `len == columns.len()` of the preceding schema.
    Row(Vec<SqlValue>),
    /// Statement completion (DONE or DONEPROC) with attached errors.
    Done(Done),
    /// Completion inside a stored procedure; never terminates the response.
    DoneInProc(Done),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Feature extension acknowledgment.
    FeatureExtAck(FeatureExtAck),
    /// Raw SSPI payload.
    Sspi(Bytes),
    /// Federated authentication endpoints.
    FedAuthInfo(FedAuthInfo),
}

/// One result-set column descriptor.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column flags.
    pub flags: u16,
    /// User type code.
    pub user_type: u32,
    /// Wire type of the cell data (the ciphertext type when encrypted).
    pub type_info: TypeInfo,
    /// Encryption metadata, present iff the column is encrypted and the
    /// session negotiated Always Encrypted.
    pub crypto: Option<CryptoMetadata>,
}

impl Column {
    /// Whether the column is nullable.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags & COLUMN_FLAG_NULLABLE != 0
    }

    /// Whether the column value is encrypted on the wire.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags & COLUMN_FLAG_ENCRYPTED != 0
    }
}

/// Decoded COLMETADATA72: the optional CEK table and the ordered columns.
#[derive(Debug, Clone)]
pub struct ColMetaData {
    /// CEK table, present when Always Encrypted is on and keys were sent.
    pub cek_table: Option<Arc<CekTable>>,
    /// Ordered column descriptors.
    pub columns: Vec<Column>,
}

impl ColMetaData {
    /// Column count meaning "no metadata".
    pub const NO_METADATA: u16 = 0xFFFF;

    /// Decode a COLMETADATA72 body.
    pub async fn decode<S>(src: &mut S, always_encrypted: bool) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let count = src.read_u16().await?;
        if count == Self::NO_METADATA {
            return Ok(Self {
                cek_table: None,
                columns: Vec::new(),
            });
        }

        let cek_table = if always_encrypted {
            CekTable::decode(src).await?
        } else {
            None
        };

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let user_type = src.read_u32().await?;
            let flags = src.read_u16().await?;
            let type_id_byte = src.read_u8().await?;

            let mut type_info = TypeInfo::decode(src, type_id_byte).await?;
            type_info.user_type = user_type;
            type_info.flags = flags;

            // Deprecated LOB types carry the owning table name.
            if type_info.type_id.is_textptr_lob() {
                read_sql_identifier(src).await?;
            }

            let crypto = if flags & COLUMN_FLAG_ENCRYPTED != 0 && always_encrypted {
                let mut meta = CryptoMetadata::decode(src, cek_table.as_ref()).await?;
                meta.plain_type.flags = flags;
                Some(meta)
            } else {
                None
            };

            let name = src.read_b_varchar().await?;

            columns.push(Column {
                name,
                flags,
                user_type,
                type_info,
                crypto,
            });
        }

        Ok(Self { cek_table, columns })
    }
}

/// Skip a multi-part SQL identifier: a part count then one US_VARCHAR per
/// part.
async fn read_sql_identifier<S>(src: &mut S) -> Result<(), ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    let parts = src.read_u8().await?;
    for _ in 0..parts {
        let _ = src.read_us_varchar().await?;
    }
    Ok(())
}

/// Decode a ROW body against the current columns.
///
/// Encrypted cells come back as ciphertext; the response reader decrypts
/// and re-reads them before emitting the row.
pub async fn decode_row<S>(src: &mut S, columns: &[Column]) -> Result<Vec<SqlValue>, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    let mut row = Vec::with_capacity(columns.len());
    for column in columns {
        row.push(column.type_info.read_value(src).await?);
    }
    Ok(row)
}

/// Decode an NBCROW body: a leading null bitmap, then only the non-null
/// cells. Bit *i* set means column *i* is NULL and contributes no bytes.
pub async fn decode_nbc_row<S>(
    src: &mut S,
    columns: &[Column],
) -> Result<Vec<SqlValue>, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    let bitmap_len = columns.len().div_ceil(8);
    let bitmap = src.read_bytes(bitmap_len).await?;

    let mut row = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            row.push(SqlValue::Null);
        } else {
            row.push(column.type_info.read_value(src).await?);
        }
    }
    Ok(row)
}

/// DONE status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DoneStatus(pub u16);

impl DoneStatus {
    /// Final completion, no bits set.
    pub const FINAL: u16 = 0x0000;
    /// More result sets follow.
    pub const MORE: u16 = 0x0001;
    /// An error terminated the statement.
    pub const ERROR: u16 = 0x0002;
    /// A transaction is in progress.
    pub const INXACT: u16 = 0x0004;
    /// The row count is valid.
    pub const COUNT: u16 = 0x0010;
    /// Acknowledges an attention request.
    pub const ATTN: u16 = 0x0020;
    /// The server had an internal error.
    pub const SRVERROR: u16 = 0x0100;

    /// More results follow this completion.
    #[must_use]
    pub fn more(self) -> bool {
        self.0 & Self::MORE != 0
    }

    /// The statement failed.
    #[must_use]
    pub fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    /// A transaction is open.
    #[must_use]
    pub fn in_xact(self) -> bool {
        self.0 & Self::INXACT != 0
    }

    /// The row count field is authoritative.
    #[must_use]
    pub fn count(self) -> bool {
        self.0 & Self::COUNT != 0
    }

    /// The completion acknowledges an attention request.
    #[must_use]
    pub fn attn(self) -> bool {
        self.0 & Self::ATTN != 0
    }

    /// The server hit an internal error.
    #[must_use]
    pub fn srverror(self) -> bool {
        self.0 & Self::SRVERROR != 0
    }
}

/// Statement completion token (DONE, DONEPROC, DONEINPROC).
#[derive(Debug, Clone, Default)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Token of the current command.
    pub cur_cmd: u16,
    /// Row count, valid when the COUNT bit is set.
    pub row_count: u64,
    /// ERROR tokens buffered earlier in the response; attached only on the
    /// terminal DONE/DONEPROC.
    pub errors: Vec<ServerError>,
}

impl Done {
    /// Decode a DONE body.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let status = DoneStatus(src.read_u16().await?);
        let cur_cmd = src.read_u16().await?;
        let row_count = src.read_u64().await?;
        Ok(Self {
            status,
            cur_cmd,
            row_count,
            errors: Vec::new(),
        })
    }

    /// Whether this completion reports a failure, either via the ERROR
    /// status bit or via buffered ERROR tokens.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status.error() || !self.errors.is_empty()
    }

    /// The failure to report: the last buffered error, or a synthetic one
    /// when the ERROR bit is set without any ERROR token.
    #[must_use]
    pub fn sql_error(&self) -> ServerError {
        match self.errors.last() {
            Some(err) => err.clone(),
            None => ServerError {
                message: "Request failed but didn't provide reason".into(),
                ..ServerError::default()
            },
        }
    }
}

/// Server error or informational message (ERROR and INFO share the shape).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Reporting server name.
    pub server: String,
    /// Procedure name, empty outside procedures.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: i32,
}

impl ServerError {
    /// Decode an ERROR or INFO body.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let _length = src.read_u16().await?; // informational
        let number = src.read_i32().await?;
        let state = src.read_u8().await?;
        let class = src.read_u8().await?;
        let message = src.read_us_varchar().await?;
        let server = src.read_b_varchar().await?;
        let procedure = src.read_b_varchar().await?;
        let line = src.read_i32().await?;
        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mssql: error {} severity {} state {}: {}",
            self.number, self.class, self.state, self.message
        )
    }
}

/// Login acknowledgment.
#[derive(Debug, Clone)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// Negotiated TDS version. Big-endian on the wire, unlike every other
    /// integer in the stream.
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version, also big-endian.
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode a LOGINACK body.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let size = src.read_u16().await? as usize;
        let buf = src.read_bytes(size).await?;
        if size < 10 {
            return Err(ProtocolError::bad_stream("LOGINACK body too short"));
        }

        let interface = buf[0];
        let tds_version = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let name_chars = buf[5] as usize;
        let name_end = 6 + name_chars * 2;
        if name_end + 4 > size {
            return Err(ProtocolError::bad_stream("LOGINACK program name overruns body"));
        }
        let prog_name = codec::decode_ucs2(&buf[6..name_end])
            .ok_or_else(|| ProtocolError::StringEncoding("invalid LOGINACK program name".into()))?;
        let prog_version =
            u32::from_be_bytes([buf[size - 4], buf[size - 3], buf[size - 2], buf[size - 1]]);

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }
}

/// Column ordering information.
#[derive(Debug, Clone)]
pub struct Order {
    /// Column ids in result order.
    pub column_ids: Vec<u16>,
}

impl Order {
    /// Decode an ORDER body: a byte length followed by u16 column ids.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let len = src.read_u16().await? as usize;
        let raw = src.read_bytes(len).await?;
        let column_ids = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { column_ids })
    }
}

/// Feature extension acknowledgment terminator byte.
pub const FEATURE_EXT_TERMINATOR: u8 = 0xFF;

/// Feature id for federated authentication.
pub const FEATURE_FEDAUTH: u8 = 0x02;

/// Feature id for column encryption (Always Encrypted).
pub const FEATURE_COLUMN_ENCRYPTION: u8 = 0x04;

/// One acknowledged feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureAck {
    /// Federated authentication echo.
    FedAuth {
        /// 32-byte nonce when the payload carries one.
        nonce: Option<Bytes>,
        /// 32-byte signature when the payload carries one.
        signature: Option<Bytes>,
    },
    /// Column encryption negotiation result.
    ColumnEncryption {
        /// Protocol version of the feature.
        version: u8,
    },
}

/// Feature extension acknowledgment: feature id to payload.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtAck {
    /// Recognized features; unknown features are skipped on the wire.
    pub features: HashMap<u8, FeatureAck>,
}

impl FeatureExtAck {
    /// Decode a FEATUREEXTACK body.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let mut features = HashMap::new();
        loop {
            let feature = src.read_u8().await?;
            if feature == FEATURE_EXT_TERMINATOR {
                break;
            }
            let mut remaining = src.read_u32().await? as usize;

            match feature {
                FEATURE_FEDAUTH => {
                    let mut nonce = None;
                    let mut signature = None;
                    if remaining >= 32 {
                        nonce = Some(Bytes::from(src.read_bytes(32).await?));
                        remaining -= 32;
                    }
                    if remaining >= 32 {
                        signature = Some(Bytes::from(src.read_bytes(32).await?));
                        remaining -= 32;
                    }
                    features.insert(feature, FeatureAck::FedAuth { nonce, signature });
                }
                FEATURE_COLUMN_ENCRYPTION => {
                    if remaining < 1 {
                        return Err(ProtocolError::bad_stream(
                            "COLUMNENCRYPTION ack missing version",
                        ));
                    }
                    let version = src.read_u8().await?;
                    remaining -= 1;
                    if remaining > 0 {
                        let enclave_len = src.read_u8().await? as usize;
                        remaining -= 1;
                        if enclave_len > remaining {
                            return Err(ProtocolError::bad_stream(
                                "COLUMNENCRYPTION enclave type overruns feature",
                            ));
                        }
                        let _ = src.read_bytes(enclave_len).await?;
                        remaining -= enclave_len;
                    }
                    features.insert(feature, FeatureAck::ColumnEncryption { version });
                }
                _ => {}
            }

            if remaining > 0 {
                let _ = src.read_bytes(remaining).await?;
            }
        }
        Ok(Self { features })
    }
}

/// Federated authentication info option id: security token service URL.
const FEDAUTH_INFO_STS_URL: u8 = 0x01;

/// Federated authentication info option id: server SPN.
const FEDAUTH_INFO_SPN: u8 = 0x02;

/// Federated authentication endpoints.
#[derive(Debug, Clone, Default)]
pub struct FedAuthInfo {
    /// Security token service URL.
    pub sts_url: String,
    /// Server service principal name.
    pub server_spn: String,
}

impl FedAuthInfo {
    /// Decode a FEDAUTHINFO body.
    ///
    /// Option offsets come from the wire and are validated against the
    /// declared size before any slicing; a violation is a stream error,
    /// never an out-of-range read.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let size = src.read_u32().await?;
        let count = src.read_u32().await?;

        // Offsets count from after the size field: 4 bytes for the option
        // count plus 9 per option descriptor.
        let header = 4u32
            .checked_add(count.checked_mul(9).ok_or_else(fedauth_overflow)?)
            .ok_or_else(fedauth_overflow)?;
        if header > size {
            return Err(ProtocolError::bad_stream(format!(
                "fed auth info declares {count} options but only {size} bytes"
            )));
        }

        struct Opt {
            id: u8,
            length: u32,
            offset: u32,
        }
        let mut opts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = src.read_u8().await?;
            let length = src.read_u32().await?;
            let offset = src.read_u32().await?;
            opts.push(Opt { id, length, offset });
        }

        let data = src.read_bytes((size - header) as usize).await?;

        let mut info = Self::default();
        for opt in opts {
            if opt.offset < header {
                return Err(ProtocolError::bad_stream(format!(
                    "fed auth info option offset {} is before data begins at {header}",
                    opt.offset
                )));
            }
            let end = opt
                .offset
                .checked_add(opt.length)
                .ok_or_else(fedauth_overflow)?;
            if end > size {
                return Err(ProtocolError::bad_stream(format!(
                    "fed auth info option ends at {end}, past declared size {size}"
                )));
            }

            let start = (opt.offset - header) as usize;
            let slice = &data[start..start + opt.length as usize];
            let text = codec::decode_ucs2(slice).ok_or_else(|| {
                ProtocolError::StringEncoding("invalid UCS-2 in fed auth info".into())
            })?;
            match opt.id {
                FEDAUTH_INFO_STS_URL => info.sts_url = text,
                FEDAUTH_INFO_SPN => info.server_spn = text,
                other => {
                    return Err(ProtocolError::bad_stream(format!(
                        "unexpected fed auth info option id {other}"
                    )));
                }
            }
        }
        Ok(info)
    }
}

fn fedauth_overflow() -> ProtocolError {
    ProtocolError::bad_stream("fed auth info sizes overflow")
}

/// Decode an SSPI body: a size-prefixed opaque payload.
pub async fn decode_sspi<S>(src: &mut S) -> Result<Bytes, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    let size = src.read_u16().await? as usize;
    Ok(Bytes::from(src.read_bytes(size).await?))
}

/// Decoded RETURNVALUE token.
#[derive(Debug, Clone)]
pub struct ReturnValue {
    /// Parameter ordinal (informational).
    pub param_ordinal: u16,
    /// Parameter name as sent, including the leading `@`.
    pub name: String,
    /// Status byte.
    pub status: u8,
    /// User type code.
    pub user_type: u32,
    /// Flags.
    pub flags: u16,
    /// Crypto metadata, consumed when Always Encrypted is negotiated. The
    /// CEK table is not re-sent for RETURNVALUE, so this is the table-less
    /// nested form.
    pub crypto: Option<CryptoMetadata>,
    /// The decoded value.
    pub value: SqlValue,
}

impl ReturnValue {
    /// Decode a RETURNVALUE body.
    pub async fn decode<S>(src: &mut S, always_encrypted: bool) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let param_ordinal = src.read_u16().await?;
        let name = src.read_b_varchar().await?;
        let status = src.read_u8().await?;

        let user_type = src.read_u32().await?;
        let flags = src.read_u16().await?;
        let type_id_byte = src.read_u8().await?;

        let crypto = if always_encrypted {
            Some(CryptoMetadata::decode(src, None).await?)
        } else {
            None
        };

        let mut type_info = TypeInfo::decode(src, type_id_byte).await?;
        type_info.user_type = user_type;
        type_info.flags = flags;

        let value = type_info.read_value(src).await?;

        Ok(Self {
            param_ordinal,
            name,
            status,
            user_type,
            flags,
            crypto,
            value,
        })
    }

    /// Parameter name without the wire-encoding `@` prefix.
    #[must_use]
    pub fn output_name(&self) -> &str {
        self.name.strip_prefix('@').unwrap_or(&self.name)
    }
}

/// Decode a RETURNSTATUS body.
pub async fn decode_return_status<S>(src: &mut S) -> Result<i32, ProtocolError>
where
    S: ResponseSource + ?Sized,
{
    src.read_i32().await
}
