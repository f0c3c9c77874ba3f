//! Always Encrypted wire metadata.
//!
//! When column encryption is negotiated, a COLMETADATA token is preceded by
//! a table of Column Encryption Keys and each encrypted column carries a
//! crypto-metadata block pointing into that table by ordinal. This module
//! holds the wire shapes only; key unwrapping and cell decryption live in
//! the `mssql-ae` crate.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::source::ResponseSource;
use crate::typeinfo::TypeInfo;

/// Wire value for deterministic encryption.
pub const ENCRYPTION_TYPE_DETERMINISTIC: u8 = 1;

/// Wire value for randomized encryption.
pub const ENCRYPTION_TYPE_RANDOMIZED: u8 = 2;

/// Algorithm id meaning "custom algorithm, name follows".
pub const CIPHER_ALGORITHM_CUSTOM: u8 = 0x00;

/// One encrypted copy of a Column Encryption Key.
///
/// An entry may carry several values when key rotation is in progress, each
/// wrapped by a different Column Master Key.
#[derive(Debug, Clone)]
pub struct CekValue {
    /// The CEK encrypted under a Column Master Key.
    pub encrypted_key: Bytes,
    /// Key store provider name (e.g. `MSSQL_CERTIFICATE_STORE`).
    pub key_store_name: String,
    /// Path of the Column Master Key within the store.
    pub key_path: String,
    /// Asymmetric algorithm that wrapped the CEK (e.g. `RSA_OAEP`).
    pub algorithm_name: String,
}

impl CekValue {
    /// Decode one CEK value.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let encrypted_key = Bytes::from(src.read_us_varbyte().await?);
        let key_store_name = src.read_b_varchar().await?;
        let key_path = src.read_us_varchar().await?;
        let algorithm_name = src.read_b_varchar().await?;
        Ok(Self {
            encrypted_key,
            key_store_name,
            key_path,
            algorithm_name,
        })
    }
}

/// One entry of the CEK table.
#[derive(Debug, Clone)]
pub struct CekEntry {
    /// Database the key belongs to.
    pub database_id: i32,
    /// Key id within the database.
    pub cek_id: i32,
    /// Key version, incremented on rotation.
    pub cek_version: i32,
    /// Opaque metadata version.
    pub cek_md_version: [u8; 8],
    /// Encrypted key values.
    pub values: Vec<CekValue>,
}

impl CekEntry {
    /// Decode one CEK table entry.
    pub async fn decode<S>(src: &mut S) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let database_id = src.read_i32().await?;
        let cek_id = src.read_i32().await?;
        let cek_version = src.read_i32().await?;
        let mut cek_md_version = [0u8; 8];
        src.read_full(&mut cek_md_version).await?;

        let value_count = src.read_u8().await? as usize;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(CekValue::decode(src).await?);
        }

        Ok(Self {
            database_id,
            cek_id,
            cek_version,
            cek_md_version,
            values,
        })
    }

    /// The first (primary) encrypted value.
    #[must_use]
    pub fn primary_value(&self) -> Option<&CekValue> {
        self.values.first()
    }
}

/// The CEK table preceding the columns of an encrypted result set.
///
/// Logically per result set: columns reference entries by ordinal and the
/// table is shared read-only between them, so a later COLMETADATA cannot
/// retroactively change earlier columns.
#[derive(Debug, Clone, Default)]
pub struct CekTable {
    /// Ordered entries, addressed by crypto-metadata ordinal.
    pub entries: Vec<CekEntry>,
}

impl CekTable {
    /// Decode the table. A zero count yields `None`: no table was sent.
    pub async fn decode<S>(src: &mut S) -> Result<Option<Arc<Self>>, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let count = src.read_u16().await? as usize;
        if count == 0 {
            return Ok(None);
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(CekEntry::decode(src).await?);
        }
        Ok(Some(Arc::new(Self { entries })))
    }

    /// Entry by ordinal.
    #[must_use]
    pub fn get(&self, ordinal: u16) -> Option<&CekEntry> {
        self.entries.get(ordinal as usize)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-column encryption metadata.
#[derive(Debug, Clone)]
pub struct CryptoMetadata {
    /// The CEK table of the enclosing result set, absent for the nested
    /// RETURNVALUE form (the table is not re-sent there).
    pub cek_table: Option<Arc<CekTable>>,
    /// Ordinal into the CEK table; zero when no table accompanies the block.
    pub ordinal: u16,
    /// Cipher algorithm id; `0x00` means custom and a name follows.
    pub algorithm_id: u8,
    /// Custom algorithm name, present only for `algorithm_id == 0x00`.
    pub algorithm_name: Option<String>,
    /// Deterministic (1) or randomized (2) encryption.
    pub encryption_type: u8,
    /// Normalization rule version.
    pub norm_rule_version: u8,
    /// TYPE_INFO describing the plaintext shape of the column.
    pub plain_type: TypeInfo,
}

impl CryptoMetadata {
    /// Decode a crypto-metadata block.
    ///
    /// The leading ordinal is present only when a CEK table accompanies the
    /// block; the ordinal is bounds-checked against that table.
    pub async fn decode<S>(
        src: &mut S,
        cek_table: Option<&Arc<CekTable>>,
    ) -> Result<Self, ProtocolError>
    where
        S: ResponseSource + ?Sized,
    {
        let ordinal = match cek_table {
            Some(_) => src.read_u16().await?,
            None => 0,
        };

        // Base type info of the plaintext shape: user type + type id, no
        // flags in this nested form.
        let user_type = src.read_u32().await?;
        let type_id = src.read_u8().await?;
        let mut plain_type = TypeInfo::decode(src, type_id).await?;
        plain_type.user_type = user_type;

        let algorithm_id = src.read_u8().await?;
        let algorithm_name = if algorithm_id == CIPHER_ALGORITHM_CUSTOM {
            let len = src.read_u8().await? as usize;
            Some(src.read_ucs2(len).await?)
        } else {
            None
        };

        let encryption_type = src.read_u8().await?;
        let norm_rule_version = src.read_u8().await?;

        if let Some(table) = cek_table {
            if usize::from(ordinal) >= table.len() {
                return Err(ProtocolError::bad_stream(format!(
                    "crypto metadata ordinal {ordinal} out of range, CEK table has {} entries",
                    table.len()
                )));
            }
        }

        Ok(Self {
            cek_table: cek_table.cloned(),
            ordinal,
            algorithm_id,
            algorithm_name,
            encryption_type,
            norm_rule_version,
            plain_type,
        })
    }

    /// The CEK entry this column points at, when a table is present.
    #[must_use]
    pub fn entry(&self) -> Option<&CekEntry> {
        self.cek_table.as_ref().and_then(|t| t.get(self.ordinal))
    }
}
