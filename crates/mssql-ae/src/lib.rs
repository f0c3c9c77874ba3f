//! # mssql-ae
//!
//! Client-side cryptography for SQL Server Always Encrypted.
//!
//! Selected columns arrive as ciphertext; the server never sees plaintext.
//! Decrypting a cell takes three steps, each owned by a module here:
//!
//! 1. [`keystore`]: load the Column Master Key (RSA private key +
//!    certificate) from a PKCS#12 file.
//! 2. [`key_unwrap`]: parse the encrypted-CEK envelope delivered in the
//!    token stream, verify the certificate fingerprint embedded in its key
//!    path, and RSA-OAEP-unwrap the Column Encryption Key.
//! 3. [`aead`]: derive the AEAD_AES_256_CBC_HMAC_SHA256 sub-keys from the
//!    CEK and decrypt the cell.
//!
//! The wire metadata (CEK tables, per-column crypto metadata) lives in
//! `tds-tokens`; the response reader in `mssql-response` drives the steps.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod aead;
pub mod error;
pub mod key_unwrap;
pub mod keystore;

pub use aead::{AeadCipher, EncryptionKind};
pub use error::CryptoError;
pub use key_unwrap::{EncryptedCek, sha1_hex};
pub use keystore::{KeyMaterial, KeystoreAuth, KeystoreConfig};
